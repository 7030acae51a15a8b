//! Camera RPC client: circuit breaker + retry + availability cache.
//!
//! All calls go through one retry loop with progressive timeouts. The
//! availability cache short-circuits work when the server was recently seen
//! down, without advancing the breaker; the breaker trips only on real
//! attempt failures.

use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::CameraConfig;
use crate::error::AppError;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::services::retry::RetryPolicy;

/// `/health` response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
  pub status: String,
  pub components: HealthComponents,
  pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthComponents {
  pub database: String,
  pub camera: String,
  pub disk_space_gb: f64,
}

/// `/capture` response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResponse {
  pub status: String,
  pub image_id: String,
  pub image_path: String,
  pub timestamp: String,
}

/// One entry from `/images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
  pub image_id: String,
  #[serde(default)]
  pub timestamp: Option<String>,
  #[serde(default)]
  pub size_bytes: Option<u64>,
}

/// Outcome metadata for `fetch_latest_image`.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
  pub success: bool,
  pub attempts: u32,
  pub total_time_ms: u64,
  pub delays_used_ms: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OpMetrics {
  pub total_requests: u64,
  pub successes: u64,
  pub failures: u64,
  pub cumulative_duration_ms: u64,
}

pub struct CameraClient {
  base_url: String,
  api_key: Option<String>,
  http: reqwest::Client,
  breaker: Arc<CircuitBreaker>,
  policy: RetryPolicy,
  availability: Mutex<Option<Instant>>,
  availability_ttl: Duration,
  metrics: DashMap<&'static str, OpMetrics>,
}

impl CameraClient {
  pub fn new(config: &CameraConfig) -> Self {
    Self {
      base_url: config.base_url.trim_end_matches('/').to_string(),
      api_key: config.api_key.clone(),
      http: reqwest::Client::new(),
      breaker: CircuitBreaker::new(
        "camera",
        config.failure_threshold,
        Duration::from_secs(config.cooldown_secs),
      ),
      policy: RetryPolicy::default(),
      availability: Mutex::new(None),
      availability_ttl: Duration::from_secs(config.availability_cache_ttl_secs),
      metrics: DashMap::new(),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub async fn breaker_state(&self) -> CircuitState {
    self.breaker.state().await
  }

  pub fn metrics(&self, operation: &str) -> OpMetrics {
    self
      .metrics
      .get(operation)
      .map(|m| *m)
      .unwrap_or_default()
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  fn get(&self, path: &str) -> reqwest::RequestBuilder {
    let mut req = self.http.get(self.url(path));
    if let Some(key) = &self.api_key {
      req = req.header("X-API-Key", key);
    }
    req
  }

  fn post(&self, path: &str) -> reqwest::RequestBuilder {
    let mut req = self.http.post(self.url(path));
    if let Some(key) = &self.api_key {
      req = req.header("X-API-Key", key);
    }
    req
  }

  /// Liveness probe with a positive cache: a recent success is trusted for
  /// the cache TTL and does not touch the network or the breaker.
  #[instrument(skip(self))]
  pub async fn check_connection(&self, force: bool) -> bool {
    if !force {
      let cached = self.availability.lock().await;
      if let Some(seen_up) = *cached {
        if seen_up.elapsed() < self.availability_ttl {
          return true;
        }
      }
    }

    let result = self
      .get("/test")
      .timeout(RetryPolicy::request_timeout(0))
      .send()
      .await;

    match result {
      Ok(resp) if resp.status().is_success() => {
        *self.availability.lock().await = Some(Instant::now());
        true
      }
      Ok(resp) => {
        debug!(status = %resp.status(), "camera liveness probe rejected");
        *self.availability.lock().await = None;
        false
      }
      Err(e) => {
        debug!(error = %e, "camera liveness probe failed");
        *self.availability.lock().await = None;
        false
      }
    }
  }

  async fn record(&self, operation: &'static str, started: Instant, success: bool) {
    let mut entry = self.metrics.entry(operation).or_default();
    entry.total_requests += 1;
    entry.cumulative_duration_ms += started.elapsed().as_millis() as u64;
    if success {
      entry.successes += 1;
    } else {
      entry.failures += 1;
    }
  }

  /// The shared retry loop: availability cache, breaker gate, progressive
  /// timeout, backoff with jitter between attempts. A server the liveness
  /// probe already knows is down fails the call without consuming breaker
  /// budget.
  async fn call_json<T, B>(
    &self,
    operation: &'static str,
    max_attempts: u32,
    build: B,
  ) -> Result<T, AppError>
  where
    T: DeserializeOwned,
    B: Fn() -> reqwest::RequestBuilder,
  {
    let max_attempts = max_attempts.max(1);
    let mut last_error: Option<AppError> = None;

    for attempt in 0..max_attempts {
      if !self.check_connection(false).await {
        return Err(AppError::ServiceUnavailable(
          "camera server unreachable".to_string(),
        ));
      }

      if !self.breaker.is_available().await {
        return Err(AppError::CircuitOpen(self.breaker.name().to_string()));
      }

      let started = Instant::now();
      let result = build()
        .timeout(RetryPolicy::request_timeout(attempt))
        .send()
        .await;

      match result {
        Ok(resp) if resp.status().is_success() => {
          let parsed = resp.json::<T>().await;
          match parsed {
            Ok(value) => {
              self.breaker.record_success().await;
              self.record(operation, started, true).await;
              return Ok(value);
            }
            Err(e) => {
              self.breaker.record_failure().await;
              self.record(operation, started, false).await;
              return Err(AppError::Internal(format!(
                "camera response malformed: {}",
                e
              )));
            }
          }
        }
        Ok(resp) => {
          self.breaker.record_failure().await;
          self.record(operation, started, false).await;
          last_error = Some(AppError::ServiceUnavailable(format!(
            "camera server returned {}",
            resp.status()
          )));
        }
        Err(e) => {
          self.breaker.record_failure().await;
          self.record(operation, started, false).await;
          last_error = Some(AppError::Http(e));
        }
      }

      if attempt + 1 < max_attempts {
        let delay = self.policy.delay_for(attempt);
        warn!(
          operation,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          "camera call failed, backing off"
        );
        tokio::time::sleep(delay).await;
      }
    }

    Err(last_error.unwrap_or_else(|| AppError::ServiceUnavailable("camera server".to_string())))
  }

  #[instrument(skip(self))]
  pub async fn health_check(&self) -> Result<HealthReport, AppError> {
    self
      .call_json("health_check", 2, || self.get("/health"))
      .await
  }

  #[instrument(skip(self))]
  pub async fn capture(&self, max_attempts: u32) -> Result<CaptureResponse, AppError> {
    let response: CaptureResponse = self
      .call_json("capture", max_attempts, || self.post("/capture"))
      .await?;
    info!(image_id = %response.image_id, "image captured");
    Ok(response)
  }

  #[instrument(skip(self))]
  pub async fn list_images(&self) -> Result<Vec<ImageInfo>, AppError> {
    self.call_json("list_images", 2, || self.get("/images")).await
  }

  /// Download the newest frame, iteratively retrying with backoff. Returns
  /// the saved path together with a report of every attempt and delay, so
  /// callers can see exactly what the retry loop did.
  #[instrument(skip(self))]
  pub async fn fetch_latest_image(
    &self,
    save_path: Option<PathBuf>,
    max_attempts: u32,
  ) -> (Option<PathBuf>, FetchReport) {
    let max_attempts = max_attempts.max(1);
    let started = Instant::now();
    let mut delays_used_ms = Vec::new();
    let mut attempts = 0;

    let target = save_path.unwrap_or_else(|| {
      std::env::temp_dir().join(format!("camera_latest_{}.jpg", Utc::now().timestamp()))
    });

    while attempts < max_attempts {
      attempts += 1;

      if !self.check_connection(false).await {
        break;
      }

      if !self.breaker.is_available().await {
        break;
      }

      let attempt_started = Instant::now();
      match self.fetch_bytes("/latest_image", attempts - 1).await {
        Ok(bytes) => {
          if let Err(e) = write_image(&target, &bytes) {
            warn!(error = %e, "failed to persist fetched image");
            self.record("fetch_latest_image", attempt_started, false).await;
            break;
          }
          self.breaker.record_success().await;
          self.record("fetch_latest_image", attempt_started, true).await;
          let report = FetchReport {
            success: true,
            attempts,
            total_time_ms: started.elapsed().as_millis() as u64,
            delays_used_ms,
          };
          return (Some(target), report);
        }
        Err(e) => {
          debug!(attempt = attempts, error = %e, "latest-image fetch failed");
          self.breaker.record_failure().await;
          self.record("fetch_latest_image", attempt_started, false).await;
        }
      }

      if attempts < max_attempts {
        let delay = self.policy.delay_for(attempts - 1);
        delays_used_ms.push(delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
      }
    }

    let report = FetchReport {
      success: false,
      attempts,
      total_time_ms: started.elapsed().as_millis() as u64,
      delays_used_ms,
    };
    (None, report)
  }

  #[instrument(skip(self))]
  pub async fn fetch_image(&self, image_id: &str, save_path: &Path) -> Result<(), AppError> {
    if !self.check_connection(false).await {
      return Err(AppError::ServiceUnavailable(
        "camera server unreachable".to_string(),
      ));
    }

    if !self.breaker.is_available().await {
      return Err(AppError::CircuitOpen(self.breaker.name().to_string()));
    }

    let started = Instant::now();
    match self.fetch_bytes(&format!("/image/{}", image_id), 0).await {
      Ok(bytes) => {
        write_image(save_path, &bytes)?;
        self.breaker.record_success().await;
        self.record("fetch_image", started, true).await;
        Ok(())
      }
      Err(e) => {
        self.breaker.record_failure().await;
        self.record("fetch_image", started, false).await;
        Err(e)
      }
    }
  }

  async fn fetch_bytes(&self, path: &str, attempt: u32) -> Result<bytes::Bytes, AppError> {
    let resp = self
      .get(path)
      .timeout(RetryPolicy::request_timeout(attempt))
      .send()
      .await?;

    if !resp.status().is_success() {
      return Err(AppError::ServiceUnavailable(format!(
        "camera server returned {}",
        resp.status()
      )));
    }

    Ok(resp.bytes().await?)
  }
}

fn write_image(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let tmp = path.with_extension("tmp");
  std::fs::write(&tmp, bytes)?;
  std::fs::rename(&tmp, path)?;
  Ok(())
}
