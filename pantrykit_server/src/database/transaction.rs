//! Scoped transaction runtime with retry on transient faults.
//!
//! `execute_in_transaction` runs a closure against a fresh transaction per
//! attempt: commit on `Ok`, roll back on `Err`, and retry only errors the
//! classifier tags as transient. The closure must be idempotent with respect
//! to retry; it is re-invoked from scratch.

use futures::future::BoxFuture;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{classify_sqlx_error, AppError};

pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TX_ATTEMPTS: u32 = 3;

/// One logged operation inside a transaction, for diagnostics.
#[derive(Debug, Clone)]
pub struct OpRecord {
  pub operation: &'static str,
  pub table: String,
  pub rows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
  Active,
  Committed,
  Aborted,
}

/// A live transaction scope. Operations are forbidden to escape it: the
/// session owns the underlying transaction and is consumed by the runtime.
pub struct TxSession {
  tx: Option<Transaction<'static, Postgres>>,
  deadline: Instant,
  timeout: Duration,
  ops: Vec<OpRecord>,
  state: TxState,
}

impl TxSession {
  async fn begin(pool: &PgPool, timeout: Duration) -> Result<Self, AppError> {
    let tx = pool.begin().await.map_err(classify_sqlx_error)?;
    Ok(Self {
      tx: Some(tx),
      deadline: Instant::now() + timeout,
      timeout,
      ops: Vec::new(),
      state: TxState::Active,
    })
  }

  /// Checked before every operation; breach aborts the scope.
  fn check_deadline(&mut self) -> Result<(), AppError> {
    if Instant::now() >= self.deadline {
      self.state = TxState::Aborted;
      self.tx = None;
      return Err(AppError::TransactionTimedOut(self.timeout));
    }
    Ok(())
  }

  fn ensure_active(&self) -> Result<(), AppError> {
    match self.state {
      TxState::Active => Ok(()),
      TxState::Aborted => Err(AppError::TransactionAlreadyAborted),
      TxState::Committed => Err(AppError::TransactionAborted(
        "operation after commit".to_string(),
      )),
    }
  }

  fn conn(&mut self) -> Result<&mut Transaction<'static, Postgres>, AppError> {
    self
      .tx
      .as_mut()
      .ok_or_else(|| AppError::TransactionAborted("transaction closed".to_string()))
  }

  /// Run a write statement, recording (operation, table, affected rows).
  pub async fn execute(
    &mut self,
    operation: &'static str,
    table: &str,
    query: sqlx::query::Query<'_, Postgres, PgArguments>,
  ) -> Result<PgQueryResult, AppError> {
    self.ensure_active()?;
    self.check_deadline()?;
    let result = query
      .execute(&mut **self.conn()?)
      .await
      .map_err(classify_sqlx_error)?;
    self.ops.push(OpRecord {
      operation,
      table: table.to_string(),
      rows: result.rows_affected(),
    });
    Ok(result)
  }

  /// Run a single-row read.
  pub async fn fetch_one<T>(
    &mut self,
    table: &str,
    query: sqlx::query::QueryAs<'_, Postgres, T, PgArguments>,
  ) -> Result<T, AppError>
  where
    T: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow>,
  {
    self.ensure_active()?;
    self.check_deadline()?;
    let row = query
      .fetch_one(&mut **self.conn()?)
      .await
      .map_err(classify_sqlx_error)?;
    self.ops.push(OpRecord {
      operation: "find_one",
      table: table.to_string(),
      rows: 1,
    });
    Ok(row)
  }

  /// Run an optional single-row read.
  pub async fn fetch_optional<T>(
    &mut self,
    table: &str,
    query: sqlx::query::QueryAs<'_, Postgres, T, PgArguments>,
  ) -> Result<Option<T>, AppError>
  where
    T: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow>,
  {
    self.ensure_active()?;
    self.check_deadline()?;
    let row = query
      .fetch_optional(&mut **self.conn()?)
      .await
      .map_err(classify_sqlx_error)?;
    let found = u64::from(row.is_some());
    self.ops.push(OpRecord {
      operation: "find_one",
      table: table.to_string(),
      rows: found,
    });
    Ok(row)
  }

  /// Run a multi-row read.
  pub async fn fetch_all<T>(
    &mut self,
    table: &str,
    query: sqlx::query::QueryAs<'_, Postgres, T, PgArguments>,
  ) -> Result<Vec<T>, AppError>
  where
    T: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow>,
  {
    self.ensure_active()?;
    self.check_deadline()?;
    let rows = query
      .fetch_all(&mut **self.conn()?)
      .await
      .map_err(classify_sqlx_error)?;
    self.ops.push(OpRecord {
      operation: "find",
      table: table.to_string(),
      rows: rows.len() as u64,
    });
    Ok(rows)
  }

  /// Commit. A second commit is a no-op with a warning; commit after abort
  /// fails.
  pub async fn commit(&mut self) -> Result<(), AppError> {
    match self.state {
      TxState::Committed => {
        warn!("double commit ignored");
        return Ok(());
      }
      TxState::Aborted => return Err(AppError::TransactionAlreadyAborted),
      TxState::Active => {}
    }

    let tx = self
      .tx
      .take()
      .ok_or_else(|| AppError::TransactionAborted("transaction closed".to_string()))?;
    tx.commit().await.map_err(classify_sqlx_error)?;
    self.state = TxState::Committed;
    debug!(ops = self.ops.len(), "transaction committed");
    Ok(())
  }

  pub async fn abort(&mut self) -> Result<(), AppError> {
    if self.state != TxState::Active {
      return Ok(());
    }
    if let Some(tx) = self.tx.take() {
      tx.rollback().await.map_err(classify_sqlx_error)?;
    }
    self.state = TxState::Aborted;
    Ok(())
  }

  pub fn operations(&self) -> &[OpRecord] {
    &self.ops
  }
}

/// Runs closures inside transactions with a retry policy for transient
/// faults.
#[derive(Clone)]
pub struct TransactionRuntime {
  pool: PgPool,
  timeout: Duration,
  max_attempts: u32,
}

impl TransactionRuntime {
  pub fn new(pool: PgPool) -> Self {
    Self {
      pool,
      timeout: DEFAULT_TX_TIMEOUT,
      max_attempts: DEFAULT_TX_ATTEMPTS,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  /// Run `f` in a fresh transaction per attempt. On `Ok` the transaction is
  /// committed (unless `f` already did); on `Err` it is rolled back. Only
  /// transient errors are retried, with delay `100ms × attempt`.
  pub async fn execute_in_transaction<T, F>(&self, f: F) -> Result<T, AppError>
  where
    T: Send,
    F: for<'s> Fn(&'s mut TxSession) -> BoxFuture<'s, Result<T, AppError>> + Send + Sync,
  {
    let mut last_error: Option<AppError> = None;

    for attempt in 1..=self.max_attempts {
      // Beginning the transaction can fail transiently too (pool timeout,
      // dropped connection); those attempts count against the same budget.
      let mut session = match TxSession::begin(&self.pool, self.timeout).await {
        Ok(session) => session,
        Err(e) => {
          if e.is_transient() && attempt < self.max_attempts {
            let delay = Duration::from_millis(100 * attempt as u64);
            warn!(
              attempt,
              error = %e,
              delay_ms = delay.as_millis() as u64,
              "transient error starting transaction, retrying"
            );
            last_error = Some(e);
            tokio::time::sleep(delay).await;
            continue;
          }
          return Err(e);
        }
      };

      match f(&mut session).await {
        Ok(value) => {
          session.commit().await?;
          return Ok(value);
        }
        Err(e) => {
          let _ = session.abort().await;
          if e.is_transient() && attempt < self.max_attempts {
            let delay = Duration::from_millis(100 * attempt as u64);
            warn!(
              attempt,
              error = %e,
              delay_ms = delay.as_millis() as u64,
              "transient transaction error, retrying"
            );
            last_error = Some(e);
            tokio::time::sleep(delay).await;
            continue;
          }
          return Err(e);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| AppError::Internal("transaction retries exhausted".to_string())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // State-transition behavior that does not need a live connection.

  fn closed_session(timeout: Duration) -> TxSession {
    TxSession {
      tx: None,
      deadline: Instant::now() + timeout,
      timeout,
      ops: Vec::new(),
      state: TxState::Active,
    }
  }

  #[tokio::test]
  async fn commit_after_abort_fails() {
    let mut session = closed_session(Duration::from_secs(30));
    session.abort().await.unwrap();
    assert!(matches!(
      session.commit().await,
      Err(AppError::TransactionAlreadyAborted)
    ));
  }

  #[tokio::test]
  async fn abort_is_idempotent() {
    let mut session = closed_session(Duration::from_secs(30));
    session.abort().await.unwrap();
    session.abort().await.unwrap();
    assert_eq!(session.state, TxState::Aborted);
  }

  #[tokio::test]
  async fn deadline_breach_aborts() {
    let mut session = closed_session(Duration::from_secs(0));
    // Deadline already passed.
    assert!(matches!(
      session.check_deadline(),
      Err(AppError::TransactionTimedOut(_))
    ));
    assert!(matches!(
      session.commit().await,
      Err(AppError::TransactionAlreadyAborted)
    ));
  }

  #[tokio::test]
  async fn operations_after_commit_are_rejected() {
    let mut session = closed_session(Duration::from_secs(30));
    session.state = TxState::Committed;
    assert!(session.ensure_active().is_err());
  }
}
