mod audit;
mod grocery;
mod ids;
mod session;
mod user;

pub use audit::{AuditEvent, AuditEventType, AuditRecord};
pub use grocery::{dedupe_items, GroceryItem, GroceryList};
pub use ids::{ListId, SessionId, UserId};
pub use session::{Session, SessionInfo};
pub use user::{normalize_email, AuthProvider, OAuthAccount, User};

use serde::{Deserialize, Serialize};

/// Outcome of a credential-provider operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthResult {
  Success {
    user_id: UserId,
    email: String,
    metadata: Option<serde_json::Value>,
  },
  RequiresVerification,
  Failure {
    reason: crate::error::AuthFailureReason,
  },
}

impl AuthResult {
  pub fn is_success(&self) -> bool {
    matches!(self, AuthResult::Success { .. })
  }
}
