use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an authentication attempt was rejected.
///
/// Carried inside [`CoreError::AuthFailed`] so callers can branch on the
/// reason without string matching.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthFailureReason {
  #[error("invalid credentials")]
  InvalidCredentials,

  #[error("account is locked")]
  AccountLocked,

  #[error("email address is not verified")]
  EmailNotVerified,

  #[error("authorization code is invalid or expired")]
  InvalidAuthorizationCode,

  #[error("state parameter mismatch")]
  StateMismatch,

  #[error("provider is not enabled: {0}")]
  ProviderDisabled(String),

  #[error("password reset token is invalid or expired")]
  InvalidResetToken,

  #[error("too many attempts, try again later")]
  RateLimited,
}

/// Core domain error types.
///
/// These represent business-domain failures; infrastructure failures
/// (connection establishment, circuit breakers, automation drivers) live in
/// the server crate's error type and wrap this one.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CoreError {
  /// Database errors surfaced through sqlx
  #[error("database error: {0}")]
  Database(String),

  /// Validation errors for business rules
  #[error("validation error: {0}")]
  Validation(String),

  /// Specific validation error for user already exists case
  #[error("user already exists: {0}")]
  UserAlreadyExists(String),

  /// User not found errors
  #[error("user not found: {0}")]
  UserNotFound(String),

  /// Not found errors
  #[error("not found: {0}")]
  NotFound(String),

  /// Authentication rejected with a structured reason
  #[error("authentication failed: {0}")]
  AuthFailed(AuthFailureReason),

  /// Token expired, malformed, wrong type, or signature mismatch.
  /// Deliberately carries no detail; subcases are logged internally only.
  #[error("invalid token")]
  TokenInvalid,

  /// Token verified but the backing session row is revoked or absent
  #[error("session has been revoked")]
  SessionRevoked,

  /// Optimistic-locking failure on a versioned document
  #[error("version conflict on {entity}: expected version {expected}")]
  VersionConflict { entity: String, expected: i32 },

  /// Deadline breach inside a core operation
  #[error("timeout: {0}")]
  Timeout(String),

  /// Internal/unexpected errors
  #[error("internal error: {0}")]
  Internal(String),
}

impl CoreError {
  /// Map sqlx database errors to specific variants.
  pub fn from_database_error(error: sqlx::Error) -> Self {
    if let Some(db_err) = error.as_database_error() {
      if db_err.is_unique_violation() {
        return Self::map_unique_constraint_error(&error.to_string());
      }

      if db_err.is_check_violation() {
        return CoreError::Validation(format!("data validation failed: {}", db_err.message()));
      }
    }

    CoreError::Database(error.to_string())
  }

  fn map_unique_constraint_error(error_msg: &str) -> Self {
    if error_msg.contains("users_email_key") {
      CoreError::UserAlreadyExists("a user with this email already exists".to_string())
    } else if error_msg.contains("sessions_access_token_jti_key") {
      CoreError::Internal("access token jti collision".to_string())
    } else if error_msg.contains("grocery_lists_user_id_name_key") {
      CoreError::Validation("a grocery list with this name already exists".to_string())
    } else {
      CoreError::Database(format!("unique constraint violated: {}", error_msg))
    }
  }
}

impl From<sqlx::Error> for CoreError {
  fn from(err: sqlx::Error) -> Self {
    CoreError::from_database_error(err)
  }
}

impl From<jsonwebtoken::errors::Error> for CoreError {
  fn from(err: jsonwebtoken::errors::Error) -> Self {
    tracing::debug!(error = %err, "token validation failed");
    CoreError::TokenInvalid
  }
}

impl From<serde_json::Error> for CoreError {
  fn from(err: serde_json::Error) -> Self {
    CoreError::Internal(err.to_string())
  }
}

impl From<anyhow::Error> for CoreError {
  fn from(err: anyhow::Error) -> Self {
    CoreError::Internal(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_errors_are_uniform() {
    let err: CoreError = jsonwebtoken::errors::Error::from(
      jsonwebtoken::errors::ErrorKind::ExpiredSignature,
    )
    .into();
    assert!(matches!(err, CoreError::TokenInvalid));

    let err: CoreError =
      jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidSignature).into();
    assert!(matches!(err, CoreError::TokenInvalid));
  }

  #[test]
  fn version_conflict_carries_context() {
    let err = CoreError::VersionConflict {
      entity: "grocery_list:weekly".to_string(),
      expected: 3,
    };
    assert_eq!(
      err.to_string(),
      "version conflict on grocery_list:weekly: expected version 3"
    );
  }
}
