//! Circuit breaker for outbound dependencies.
//!
//! `Closed` until N consecutive failures, then `Open` for a cooldown during
//! which calls short-circuit. After the cooldown exactly one probe is let
//! through (`HalfOpen`); its outcome decides between `Closed` and another
//! full cooldown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum InnerState {
  Closed,
  Open(Instant),
  HalfOpen,
}

pub struct CircuitBreaker {
  name: String,
  state: RwLock<InnerState>,
  failure_count: AtomicU64,
  trip_count: AtomicU64,
  failure_threshold: u64,
  cooldown: Duration,
}

impl CircuitBreaker {
  pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      state: RwLock::new(InnerState::Closed),
      failure_count: AtomicU64::new(0),
      trip_count: AtomicU64::new(0),
      failure_threshold: failure_threshold.max(1) as u64,
      cooldown,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether a call may proceed right now. The transition out of `Open`
  /// happens here: the first caller after the cooldown becomes the probe and
  /// later callers are refused until the probe reports back.
  pub async fn is_available(&self) -> bool {
    let state = self.state.read().await;
    match *state {
      InnerState::Closed => true,
      InnerState::HalfOpen => false,
      InnerState::Open(since) => {
        if since.elapsed() < self.cooldown {
          return false;
        }
        drop(state);
        let mut state = self.state.write().await;
        // Re-check: another caller may have claimed the probe slot.
        match *state {
          InnerState::Open(since) if since.elapsed() >= self.cooldown => {
            *state = InnerState::HalfOpen;
            info!(breaker = %self.name, "cooldown elapsed, admitting probe");
            true
          }
          _ => false,
        }
      }
    }
  }

  pub async fn record_success(&self) {
    let mut state = self.state.write().await;
    match *state {
      InnerState::HalfOpen => {
        *state = InnerState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        info!(breaker = %self.name, "probe succeeded, circuit closed");
      }
      InnerState::Closed => {
        self.failure_count.store(0, Ordering::SeqCst);
      }
      InnerState::Open(_) => {}
    }
  }

  pub async fn record_failure(&self) {
    let mut state = self.state.write().await;
    match *state {
      InnerState::Closed => {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.failure_threshold {
          *state = InnerState::Open(Instant::now());
          self.trip_count.fetch_add(1, Ordering::SeqCst);
          warn!(breaker = %self.name, failures = count, "circuit opened");
        }
      }
      InnerState::HalfOpen => {
        *state = InnerState::Open(Instant::now());
        self.trip_count.fetch_add(1, Ordering::SeqCst);
        warn!(breaker = %self.name, "probe failed, circuit re-opened");
      }
      InnerState::Open(_) => {}
    }
  }

  pub async fn state(&self) -> CircuitState {
    match *self.state.read().await {
      InnerState::Closed => CircuitState::Closed,
      InnerState::Open(_) => CircuitState::Open,
      InnerState::HalfOpen => CircuitState::HalfOpen,
    }
  }

  pub fn trip_count(&self) -> u64 {
    self.trip_count.load(Ordering::SeqCst)
  }

  /// Manual reset, used after operator intervention.
  pub async fn reset(&self) {
    *self.state.write().await = InnerState::Closed;
    self.failure_count.store(0, Ordering::SeqCst);
  }
}
