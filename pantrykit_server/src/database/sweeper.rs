//! Background TTL sweepers.
//!
//! The store has no native TTL indexes, so expired session rows and audit
//! records past retention are deleted by a periodic task.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Audit records are kept for 90 days.
pub const AUDIT_RETENTION_DAYS: i64 = 90;

/// Spawn the sweeper. It wakes every `interval`, deletes expired sessions and
/// out-of-retention audit rows, and exits promptly on the shutdown signal.
pub fn spawn_ttl_sweeper(
  pool: PgPool,
  interval: Duration,
  mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown_rx.changed() => {}
      }
      if *shutdown_rx.borrow() {
        break;
      }

      match sweep_once(&pool).await {
        Ok((sessions, audits)) => {
          if sessions > 0 || audits > 0 {
            debug!(sessions, audits, "ttl sweep removed rows");
          }
        }
        Err(e) => warn!(error = %e, "ttl sweep failed"),
      }
    }
    debug!("ttl sweeper stopped");
  })
}

async fn sweep_once(pool: &PgPool) -> Result<(u64, u64), sqlx::Error> {
  let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
    .execute(pool)
    .await?
    .rows_affected();

  let cutoff = Utc::now() - ChronoDuration::days(AUDIT_RETENTION_DAYS);
  let audits = sqlx::query("DELETE FROM audit_log WHERE timestamp < $1")
    .bind(cutoff)
    .execute(pool)
    .await?
    .rows_affected();

  Ok((sessions, audits))
}
