use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::UserId;

/// Append-only security audit events. No updates, no deletes except the
/// retention sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
  UserRegistered,
  LoginSuccess,
  LoginFailed,
  TokensIssued,
  TokenRefreshed,
  TokenRevoked,
  PasswordResetRequested,
  PasswordResetCompleted,
}

impl AuditEventType {
  pub fn as_str(&self) -> &'static str {
    match self {
      AuditEventType::UserRegistered => "user_registered",
      AuditEventType::LoginSuccess => "login_success",
      AuditEventType::LoginFailed => "login_failed",
      AuditEventType::TokensIssued => "tokens_issued",
      AuditEventType::TokenRefreshed => "token_refreshed",
      AuditEventType::TokenRevoked => "token_revoked",
      AuditEventType::PasswordResetRequested => "password_reset_requested",
      AuditEventType::PasswordResetCompleted => "password_reset_completed",
    }
  }
}

impl fmt::Display for AuditEventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for AuditEventType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "user_registered" => Ok(AuditEventType::UserRegistered),
      "login_success" => Ok(AuditEventType::LoginSuccess),
      "login_failed" => Ok(AuditEventType::LoginFailed),
      "tokens_issued" => Ok(AuditEventType::TokensIssued),
      "token_refreshed" => Ok(AuditEventType::TokenRefreshed),
      "token_revoked" => Ok(AuditEventType::TokenRevoked),
      "password_reset_requested" => Ok(AuditEventType::PasswordResetRequested),
      "password_reset_completed" => Ok(AuditEventType::PasswordResetCompleted),
      other => Err(format!("unknown audit event type: {}", other)),
    }
  }
}

/// One audit record as handed to the audit repository.
///
/// `user_id` is always the numeric id; emails are recorded alongside for
/// events that happen before a user row exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
  pub event_type: AuditEventType,
  pub user_id: Option<UserId>,
  pub email: Option<String>,
  pub provider: Option<String>,
  pub ip_address: Option<String>,
  pub success: bool,
  pub failure_reason: Option<String>,
  pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
  pub fn new(event_type: AuditEventType, success: bool) -> Self {
    Self {
      event_type,
      user_id: None,
      email: None,
      provider: None,
      ip_address: None,
      success,
      failure_reason: None,
      metadata: None,
    }
  }

  pub fn user(mut self, user_id: UserId) -> Self {
    self.user_id = Some(user_id);
    self
  }

  pub fn email(mut self, email: impl Into<String>) -> Self {
    self.email = Some(email.into());
    self
  }

  pub fn provider(mut self, provider: impl Into<String>) -> Self {
    self.provider = Some(provider.into());
    self
  }

  pub fn ip_address(mut self, ip: Option<String>) -> Self {
    self.ip_address = ip;
    self
  }

  pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
    self.failure_reason = Some(reason.into());
    self
  }

  pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
    self.metadata = Some(metadata);
    self
  }
}

/// A persisted audit row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
  pub id: i64,
  pub event_type: String,
  pub user_id: Option<UserId>,
  pub email: Option<String>,
  pub provider: Option<String>,
  pub ip_address: Option<String>,
  pub success: bool,
  pub failure_reason: Option<String>,
  pub metadata: Option<serde_json::Value>,
  pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_type_round_trip() {
    for ty in [
      AuditEventType::UserRegistered,
      AuditEventType::LoginSuccess,
      AuditEventType::LoginFailed,
      AuditEventType::TokensIssued,
      AuditEventType::TokenRefreshed,
      AuditEventType::TokenRevoked,
      AuditEventType::PasswordResetRequested,
      AuditEventType::PasswordResetCompleted,
    ] {
      assert_eq!(ty.as_str().parse::<AuditEventType>().unwrap(), ty);
    }
  }

  #[test]
  fn builder_fills_optional_fields() {
    let event = AuditEvent::new(AuditEventType::LoginFailed, false)
      .email("alice@example.com")
      .provider("password")
      .ip_address(Some("127.0.0.1".to_string()))
      .failure_reason("invalid credentials");

    assert_eq!(event.email.as_deref(), Some("alice@example.com"));
    assert_eq!(event.failure_reason.as_deref(), Some("invalid credentials"));
    assert!(!event.success);
    assert!(event.user_id.is_none());
  }
}
