use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{SessionId, UserId};

/// A server-side session row backing one issued token pair.
///
/// The access and refresh JTIs are rotated in place on refresh; there is no
/// moment where both an old and a new pair route to the same row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
  pub id: SessionId,
  pub user_id: UserId,
  pub access_token_jti: String,
  pub refresh_token_jti: String,
  pub device_info: Option<String>,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub last_activity: DateTime<Utc>,
  pub revoked: bool,
}

impl Session {
  /// A session is usable iff it is not revoked and not past its expiry.
  pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
    !self.revoked && now < self.expires_at
  }
}

/// What `validate_session` hands back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
  pub session_id: SessionId,
  pub user_id: UserId,
  pub email: String,
  pub expires_at: DateTime<Utc>,
}
