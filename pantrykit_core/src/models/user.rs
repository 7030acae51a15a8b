use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use super::ids::UserId;

/// How an account authenticates.
///
/// `password_hash` on [`User`] is `None` iff the account is OAuth-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
  Password,
  OAuth(String),
}

impl AuthProvider {
  pub fn as_str(&self) -> String {
    match self {
      AuthProvider::Password => "password".to_string(),
      AuthProvider::OAuth(name) => format!("oauth:{}", name),
    }
  }

  pub fn parse(s: &str) -> Self {
    match s.strip_prefix("oauth:") {
      Some(name) => AuthProvider::OAuth(name.to_string()),
      None => AuthProvider::Password,
    }
  }
}

/// A linked external identity on a user row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAccount {
  pub provider: String,
  pub provider_user_id: String,
  pub linked_at: DateTime<Utc>,
  #[serde(default)]
  pub profile_blob: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
  pub id: UserId,
  pub email: String,
  pub email_verified: bool,
  pub auth_provider: String,
  pub password_hash: Option<String>,
  pub oauth_accounts: Json<Vec<OAuthAccount>>,
  /// Opaque to the core; the fingerprint helpers in the cache read the
  /// dietary fields out of it.
  pub profile: serde_json::Value,
  pub failed_login_attempts: i32,
  pub locked_until: Option<DateTime<Utc>>,
  pub last_login: Option<DateTime<Utc>>,
  pub last_password_change: Option<DateTime<Utc>>,
  pub password_reset_token: Option<String>,
  pub password_reset_expires: Option<DateTime<Utc>>,
  pub is_onboarded: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl User {
  /// A user is currently locked out iff `locked_until` is in the future.
  pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
    matches!(self.locked_until, Some(until) if until > now)
  }

  pub fn provider(&self) -> AuthProvider {
    AuthProvider::parse(&self.auth_provider)
  }

  pub fn has_linked_account(&self, provider: &str, provider_user_id: &str) -> bool {
    self
      .oauth_accounts
      .iter()
      .any(|a| a.provider == provider && a.provider_user_id == provider_user_id)
  }
}

/// Normalize an email for storage and lookup: trimmed and lowercased.
pub fn normalize_email(email: &str) -> String {
  email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn provider_round_trip() {
    assert_eq!(AuthProvider::Password.as_str(), "password");
    assert_eq!(
      AuthProvider::OAuth("google".to_string()).as_str(),
      "oauth:google"
    );
    assert_eq!(
      AuthProvider::parse("oauth:google"),
      AuthProvider::OAuth("google".to_string())
    );
    assert_eq!(AuthProvider::parse("password"), AuthProvider::Password);
  }

  #[test]
  fn email_normalization() {
    assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
  }

  #[test]
  fn lockout_window() {
    let now = Utc::now();
    let user = test_user(Some(now + chrono::Duration::minutes(5)));
    assert!(user.is_locked(now));

    let user = test_user(Some(now - chrono::Duration::minutes(5)));
    assert!(!user.is_locked(now));

    let user = test_user(None);
    assert!(!user.is_locked(now));
  }

  fn test_user(locked_until: Option<DateTime<Utc>>) -> User {
    User {
      id: UserId(1),
      email: "alice@example.com".to_string(),
      email_verified: true,
      auth_provider: "password".to_string(),
      password_hash: Some("x".to_string()),
      oauth_accounts: Json(vec![]),
      profile: serde_json::json!({}),
      failed_login_attempts: 0,
      locked_until,
      last_login: None,
      last_password_change: None,
      password_reset_token: None,
      password_reset_expires: None,
      is_onboarded: false,
      created_at: Utc::now(),
      updated_at: Utc::now(),
    }
  }
}
