//! Exponential backoff with jitter for outbound RPC attempts.

use rand::Rng;
use std::time::Duration;

/// Delay = `min(base · 2^attempt, cap) + uniform(0..1s)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub max_attempts: u32,
  pub jitter: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
      max_attempts: 3,
      jitter: Duration::from_secs(1),
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      ..Default::default()
    }
  }

  /// Backoff before attempt `attempt + 1` (zero-based, capped exponent).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = attempt.min(16);
    let backoff = self
      .base_delay
      .saturating_mul(1u32 << exp)
      .min(self.max_delay);
    let jitter_ms = if self.jitter.is_zero() {
      0
    } else {
      rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
    };
    backoff + Duration::from_millis(jitter_ms)
  }

  /// Progressive per-attempt request timeouts: quick first probes, patient
  /// final ones.
  pub fn request_timeout(attempt: u32) -> Duration {
    const STEPS: [u64; 4] = [3, 5, 10, 15];
    let idx = (attempt as usize).min(STEPS.len() - 1);
    Duration::from_secs(STEPS[idx])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn delay_doubles_until_the_cap() {
    let policy = RetryPolicy {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(8),
      max_attempts: 6,
      jitter: Duration::ZERO,
    };

    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    assert_eq!(policy.delay_for(4), Duration::from_secs(8)); // capped
  }

  #[test]
  fn jitter_stays_within_one_second() {
    let policy = RetryPolicy::default();
    for attempt in 0..4 {
      let base = RetryPolicy {
        jitter: Duration::ZERO,
        ..policy.clone()
      }
      .delay_for(attempt);
      for _ in 0..32 {
        let jittered = policy.delay_for(attempt);
        assert!(jittered >= base);
        assert!(jittered <= base + Duration::from_secs(1));
      }
    }
  }

  #[test]
  fn request_timeouts_are_progressive() {
    assert_eq!(RetryPolicy::request_timeout(0), Duration::from_secs(3));
    assert_eq!(RetryPolicy::request_timeout(1), Duration::from_secs(5));
    assert_eq!(RetryPolicy::request_timeout(2), Duration::from_secs(10));
    assert_eq!(RetryPolicy::request_timeout(3), Duration::from_secs(15));
    assert_eq!(RetryPolicy::request_timeout(9), Duration::from_secs(15));
  }
}
