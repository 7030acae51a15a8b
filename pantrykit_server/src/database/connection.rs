//! Thread-safe connection lifecycle for the Postgres pool.
//!
//! A single mutex guards every state read and transition; "ensure then use"
//! happens in one critical section, and the health-check worker re-checks
//! state under the same lock. There is deliberately no fast path that reads
//! state outside the lock.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::AppError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
  Disconnected,
  Connecting,
  Connected,
  Error,
}

/// In-process connection metrics, exported for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionMetrics {
  pub connection_attempts: u64,
  pub connection_failures: u64,
  pub total_connection_time_ms: u64,
  pub last_success_time: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl ConnectionMetrics {
  pub fn avg_connection_time_ms(&self) -> f64 {
    if self.connection_attempts == 0 {
      return 0.0;
    }
    self.total_connection_time_ms as f64 / self.connection_attempts as f64
  }

  pub fn success_rate(&self) -> f64 {
    if self.connection_attempts == 0 {
      return 0.0;
    }
    (self.connection_attempts - self.connection_failures) as f64 / self.connection_attempts as f64
  }
}

/// Injected factory that produces a candidate pool. The manager validates it
/// with a round-trip before advertising `Connected`.
pub type PoolFactory =
  Arc<dyn Fn() -> BoxFuture<'static, Result<PgPool, sqlx::Error>> + Send + Sync>;

struct Inner {
  status: ConnectionStatus,
  pool: Option<PgPool>,
  metrics: ConnectionMetrics,
  health_task: Option<JoinHandle<()>>,
}

pub struct ConnectionStateMachine {
  inner: Mutex<Inner>,
  factory: PoolFactory,
  health_interval: Duration,
  shutdown_tx: watch::Sender<bool>,
}

impl ConnectionStateMachine {
  pub fn new(factory: PoolFactory, health_interval: Duration) -> Arc<Self> {
    let (shutdown_tx, _) = watch::channel(false);
    Arc::new(Self {
      inner: Mutex::new(Inner {
        status: ConnectionStatus::Disconnected,
        pool: None,
        metrics: ConnectionMetrics::default(),
        health_task: None,
      }),
      factory,
      health_interval,
      shutdown_tx,
    })
  }

  /// Idempotent: returns immediately when already connected, otherwise runs
  /// the connect loop with exponential backoff (1s × 2^attempt) and fails
  /// with `ConnectionFailed` carrying the last underlying error.
  pub async fn ensure_connected(self: &Arc<Self>, max_retries: u32) -> Result<PgPool, AppError> {
    let mut inner = self.inner.lock().await;

    if inner.status == ConnectionStatus::Connected {
      if let Some(pool) = &inner.pool {
        return Ok(pool.clone());
      }
    }

    inner.status = ConnectionStatus::Connecting;
    let mut last_error = String::from("no connection attempt made");

    for attempt in 0..max_retries.max(1) {
      inner.metrics.connection_attempts += 1;
      let started = Instant::now();

      match self.connect_once().await {
        Ok(pool) => {
          let elapsed = started.elapsed();
          inner.metrics.total_connection_time_ms += elapsed.as_millis() as u64;
          inner.metrics.last_success_time = Some(Utc::now());
          inner.status = ConnectionStatus::Connected;
          inner.pool = Some(pool.clone());
          info!(elapsed_ms = elapsed.as_millis() as u64, "database connected");

          self.start_health_worker(&mut inner);
          return Ok(pool);
        }
        Err(e) => {
          inner.metrics.connection_failures += 1;
          inner.metrics.total_connection_time_ms += started.elapsed().as_millis() as u64;
          last_error = e.to_string();
          inner.metrics.last_error = Some(last_error.clone());
          inner.status = ConnectionStatus::Error;
          warn!(attempt, error = %last_error, "database connection attempt failed");

          if attempt + 1 < max_retries.max(1) {
            let delay = Duration::from_secs(1u64 << attempt.min(6));
            tokio::time::sleep(delay).await;
            inner.status = ConnectionStatus::Connecting;
          }
        }
      }
    }

    Err(AppError::ConnectionFailed(last_error))
  }

  async fn connect_once(&self) -> Result<PgPool, sqlx::Error> {
    let pool = (self.factory)().await?;
    // Server-info round-trip before the pool is advertised.
    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
  }

  /// Returns the live pool, connecting with default retries if necessary.
  pub async fn acquire(self: &Arc<Self>) -> Result<PgPool, AppError> {
    self.ensure_connected(3).await
  }

  /// Non-blocking, non-throwing: the pool only if currently `Connected`.
  pub fn try_acquire(&self) -> Option<PgPool> {
    let inner = self.inner.try_lock().ok()?;
    if inner.status == ConnectionStatus::Connected {
      inner.pool.clone()
    } else {
      None
    }
  }

  /// Signals the health worker, closes the pool, and transitions to
  /// `Disconnected`. Safe to call repeatedly and from any task.
  pub async fn disconnect(&self) {
    let _ = self.shutdown_tx.send(true);

    // Take what needs closing under the lock, then release it: the worker
    // may itself be waiting on the lock for a final ping.
    let (task, pool) = {
      let mut inner = self.inner.lock().await;
      let task = inner.health_task.take();
      let pool = inner.pool.take();
      inner.status = ConnectionStatus::Disconnected;
      (task, pool)
    };

    if let Some(task) = task {
      // The worker observes the shutdown signal even mid-sleep; give it a
      // bounded window before detaching.
      if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
        warn!("health-check worker did not stop within 5s");
      }
    }

    if let Some(pool) = pool {
      pool.close().await;
    }
    info!("database disconnected");
  }

  pub async fn status(&self) -> ConnectionStatus {
    self.inner.lock().await.status
  }

  pub async fn metrics(&self) -> ConnectionMetrics {
    self.inner.lock().await.metrics.clone()
  }

  /// Single background worker, started on the first transition to
  /// `Connected`. Pings on every tick and demotes the state to `Error` on
  /// failure; the next `ensure_connected` recovers.
  fn start_health_worker(self: &Arc<Self>, inner: &mut Inner) {
    if inner.health_task.is_some() {
      return;
    }

    // A previous disconnect leaves the signal raised; lower it so the new
    // worker does not exit on its first check.
    let _ = self.shutdown_tx.send(false);

    let manager = Arc::clone(self);
    let mut shutdown_rx = self.shutdown_tx.subscribe();
    let interval = self.health_interval;

    inner.health_task = Some(tokio::spawn(async move {
      debug!(interval_secs = interval.as_secs(), "health-check worker started");
      loop {
        if *shutdown_rx.borrow() {
          break;
        }

        tokio::select! {
          _ = tokio::time::sleep(interval) => {}
          _ = shutdown_rx.changed() => {}
        }

        if *shutdown_rx.borrow() {
          break;
        }

        let mut inner = manager.inner.lock().await;
        let Some(pool) = inner.pool.clone() else {
          continue;
        };

        match sqlx::query("SELECT 1").execute(&pool).await {
          Ok(_) => {
            debug!("health check ok");
          }
          Err(e) => {
            error!(error = %e, "health check failed");
            inner.status = ConnectionStatus::Error;
            inner.metrics.last_error = Some(e.to_string());
          }
        }
      }
      debug!("health-check worker stopped");
    }));
  }
}
