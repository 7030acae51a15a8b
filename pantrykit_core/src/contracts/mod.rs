//! Interface contracts between the core and the persistence/service layers.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::{
  AuditEvent, GroceryItem, GroceryList, ListId, Session, SessionId, User, UserId,
};

/// Request-scoped values carried explicitly into every public auth/ordering
/// operation: no thread-locals, no ambient state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
  pub ip_address: Option<String>,
  pub interface: Option<String>,
  pub device_info: Option<String>,
  /// Absolute deadline for the whole request, if the caller set one.
  pub deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
  pub fn deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
    matches!(self.deadline, Some(d) if now >= d)
  }
}

/// User row storage contract.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
  async fn insert(&self, user: NewUser) -> Result<User, CoreError>;

  async fn find_by_id(&self, id: UserId) -> Result<Option<User>, CoreError>;

  async fn find_by_email(&self, email: &str) -> Result<Option<User>, CoreError>;

  async fn exists_by_email(&self, email: &str) -> Result<bool, CoreError>;

  /// Record a failed login; returns the new attempt count and sets
  /// `locked_until` when the threshold is reached.
  async fn record_failed_login(
    &self,
    id: UserId,
    threshold: i32,
    lockout: chrono::Duration,
  ) -> Result<i32, CoreError>;

  /// Clear failure counters and stamp `last_login`.
  async fn record_successful_login(&self, id: UserId) -> Result<(), CoreError>;

  async fn set_password_hash(&self, id: UserId, password_hash: &str) -> Result<(), CoreError>;

  async fn set_reset_token(
    &self,
    id: UserId,
    token: &str,
    expires_at: DateTime<Utc>,
  ) -> Result<(), CoreError>;

  async fn clear_reset_token(&self, id: UserId) -> Result<(), CoreError>;

  async fn link_oauth_account(
    &self,
    id: UserId,
    account: crate::models::OAuthAccount,
  ) -> Result<(), CoreError>;
}

/// Input for inserting a user row. Registration-time audit happens in the
/// same transaction inside the concrete repository.
#[derive(Debug, Clone)]
pub struct NewUser {
  pub email: String,
  pub email_verified: bool,
  pub auth_provider: String,
  pub password_hash: Option<String>,
  pub profile: serde_json::Value,
  pub oauth_accounts: Vec<crate::models::OAuthAccount>,
}

/// Session row storage contract.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionRepository: Send + Sync {
  /// Insert the session row and the `tokens_issued` audit record in one
  /// transaction. The row must be durable before the token pair is returned
  /// to any caller.
  async fn create(&self, session: NewSession) -> Result<Session, CoreError>;

  async fn find_by_access_jti(&self, jti: &str) -> Result<Option<Session>, CoreError>;

  async fn find_by_refresh_jti(&self, jti: &str) -> Result<Option<Session>, CoreError>;

  /// Swap both JTIs in a single update and stamp `last_activity`; there is no
  /// intermediate state where old and new pairs are both routable.
  async fn rotate(
    &self,
    id: SessionId,
    new_access_jti: &str,
    new_refresh_jti: &str,
    new_expires_at: DateTime<Utc>,
  ) -> Result<Session, CoreError>;

  async fn touch_activity(&self, id: SessionId) -> Result<(), CoreError>;

  /// Revoke any session whose access or refresh JTI matches. Returns how many
  /// rows were revoked.
  async fn revoke_by_jti(&self, jti: &str) -> Result<u64, CoreError>;

  async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64, CoreError>;

  /// Delete rows past `expires_at`; the TTL sweeper calls this.
  async fn delete_expired(&self) -> Result<u64, CoreError>;
}

#[derive(Debug, Clone)]
pub struct NewSession {
  pub user_id: UserId,
  pub access_token_jti: String,
  pub refresh_token_jti: String,
  pub device_info: Option<String>,
  pub expires_at: DateTime<Utc>,
  pub ip_address: Option<String>,
}

/// Append-only audit storage contract.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditRepository: Send + Sync {
  async fn append(&self, event: AuditEvent) -> Result<(), CoreError>;

  /// Delete records older than the retention window. Returns the count.
  async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;
}

/// Versioned grocery-list storage contract.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GroceryListRepository: Send + Sync {
  async fn create(
    &self,
    user_id: UserId,
    name: &str,
    items: Vec<GroceryItem>,
  ) -> Result<GroceryList, CoreError>;

  async fn find(&self, user_id: UserId, name: &str) -> Result<Option<GroceryList>, CoreError>;

  async fn list_for_user(&self, user_id: UserId) -> Result<Vec<GroceryList>, CoreError>;

  /// Replace `items` iff the stored version equals `expected_version`;
  /// on success the stored version becomes `expected_version + 1`.
  async fn update_items(
    &self,
    id: ListId,
    items: Vec<GroceryItem>,
    expected_version: i32,
  ) -> Result<GroceryList, CoreError>;

  async fn delete(&self, id: ListId) -> Result<bool, CoreError>;
}
