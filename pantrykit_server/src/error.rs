use pantrykit_core::error::CoreError;
use thiserror::Error;

/// Server-side error type: the core taxonomy plus everything that involves
/// infrastructure (connections, transactions, circuits, automation drivers).
#[derive(Error, Debug)]
pub enum AppError {
  /// Required configuration absent; fatal at startup
  #[error("missing configuration: {0}")]
  ConfigMissing(String),

  /// Store connection could not be established after retries
  #[error("database connection failed: {0}")]
  ConnectionFailed(String),

  /// Recoverable inside the transaction runtime's retry loop
  #[error("transient transaction error: {0}")]
  TransactionTransient(String),

  /// Non-retryable transaction failure, surfaced to the caller
  #[error("transaction aborted: {0}")]
  TransactionAborted(String),

  /// Commit attempted after an abort
  #[error("transaction already aborted")]
  TransactionAlreadyAborted,

  /// Wall-clock deadline breached inside a transaction
  #[error("transaction timed out after {0:?}")]
  TransactionTimedOut(std::time::Duration),

  /// Downstream deemed unavailable by the breaker
  #[error("circuit breaker is open for {0}")]
  CircuitOpen(String),

  /// Any other deadline breach
  #[error("timeout: {0}")]
  Timeout(String),

  /// External automation page handle is stale or crashed
  #[error("automation page invalid: {0}")]
  PageInvalid(String),

  /// External automation session could not be (re)established
  #[error("service unavailable: {0}")]
  ServiceUnavailable(String),

  /// Post-add cart verification exhausted every strategy
  #[error("cart verification failed: {0}")]
  CartVerificationFailed(String),

  /// Cross-search product identity drift below the similarity floor
  #[error("product verification failed: {0}")]
  ProductVerificationFailed(String),

  /// External dependency policy-refused the request
  #[error("store is closed: {0}")]
  StoreClosed(String),

  #[error("validation error: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error(transparent)]
  Core(#[from] CoreError),

  #[error("internal error: {0}")]
  Internal(String),
}

impl AppError {
  /// Collapse into the core taxonomy at repository boundaries.
  pub fn into_core(self) -> CoreError {
    match self {
      AppError::Core(e) => e,
      AppError::TransactionTimedOut(d) => {
        CoreError::Timeout(format!("transaction exceeded {:?}", d))
      }
      AppError::Timeout(msg) => CoreError::Timeout(msg),
      other => CoreError::Database(other.to_string()),
    }
  }

  /// Whether the RPC retry loop and the transaction runtime may retry this
  /// error. Everything else propagates immediately.
  pub fn is_transient(&self) -> bool {
    match self {
      AppError::TransactionTransient(_) | AppError::Timeout(_) => true,
      AppError::Http(e) => e.is_timeout() || e.is_connect(),
      AppError::Io(e) => matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
          | std::io::ErrorKind::ConnectionRefused
          | std::io::ErrorKind::ConnectionReset
          | std::io::ErrorKind::ConnectionAborted
      ),
      _ => false,
    }
  }
}

/// Classify a sqlx error for the transaction retry loop.
///
/// Serialization failures (40001) and deadlocks (40P01) are transient under
/// snapshot-style isolation; so are pool/connection-level failures. Constraint
/// violations and everything else are not.
pub fn classify_sqlx_error(err: sqlx::Error) -> AppError {
  match &err {
    sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
      AppError::TransactionTransient(err.to_string())
    }
    sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
      Some("40001") | Some("40P01") => AppError::TransactionTransient(err.to_string()),
      _ => AppError::Core(CoreError::from_database_error(err)),
    },
    _ => AppError::Core(CoreError::from_database_error(err)),
  }
}

impl From<sqlx::Error> for AppError {
  fn from(err: sqlx::Error) -> Self {
    classify_sqlx_error(err)
  }
}

impl From<serde_json::Error> for AppError {
  fn from(err: serde_json::Error) -> Self {
    AppError::Internal(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transient_classification() {
    assert!(AppError::TransactionTransient("io".into()).is_transient());
    assert!(AppError::Timeout("deadline".into()).is_transient());
    assert!(!AppError::TransactionAborted("boom".into()).is_transient());
    assert!(!AppError::CircuitOpen("camera".into()).is_transient());
    assert!(!AppError::Core(CoreError::TokenInvalid).is_transient());
  }

  #[test]
  fn pool_errors_are_transient() {
    let err = classify_sqlx_error(sqlx::Error::PoolTimedOut);
    assert!(matches!(err, AppError::TransactionTransient(_)));
    assert!(err.is_transient());
  }
}
