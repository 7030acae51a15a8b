//! Centralized application configuration.
//!
//! Everything is loaded from environment variables (with `.env` support in
//! development). Required values fail startup with `ConfigMissing`; nothing
//! security-sensitive has a default.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
  pub database: DatabaseConfig,
  pub auth: AuthConfig,
  pub oauth: OAuthConfig,
  pub features: FeatureConfig,
  pub camera: CameraConfig,
  pub cache: CacheConfig,
  pub external_sessions: ExternalSessionConfig,
  pub rate_limits: RateLimitConfig,
  pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
  pub url: String,
  pub max_connections: u32,
  pub connect_timeout_secs: u64,
  pub socket_timeout_secs: u64,
  pub health_check_interval_secs: u64,
  /// Consecutive connection failures before the process gives up.
  pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
  pub token_signing_secret: String,
  pub access_token_expiry_secs: i64,
  pub refresh_token_expiry_secs: i64,
  pub reset_token_expiry_secs: i64,
  pub password_hash_cost: u32,
  pub max_login_attempts: i32,
  pub lockout_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
  pub client_id: String,
  pub client_secret: String,
  pub auth_url: String,
  pub token_url: String,
  pub jwks_url: String,
  pub allowed_issuers: Vec<String>,
  pub redirect_port: u16,
  pub scope: String,
  /// Bounded wait for the loopback callback.
  pub callback_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
  pub enable_password_auth: bool,
  pub enable_oauth: bool,
  pub require_email_verification: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
  pub base_url: String,
  pub api_key: Option<String>,
  pub failure_threshold: u32,
  pub cooldown_secs: u64,
  pub availability_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  pub root: PathBuf,
  pub ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSessionConfig {
  pub base_dir: PathBuf,
  pub ttl_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
  pub login_per_15_min: u32,
  pub password_reset_per_hour: u32,
  pub token_refresh_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
  pub log_level: String,
}

impl AppConfig {
  /// Load from the environment. Reads `.env` first so development setups
  /// work without exporting anything.
  pub fn load() -> Result<Self, AppError> {
    dotenvy::dotenv().ok();
    Self::from_env()
  }

  pub fn from_env() -> Result<Self, AppError> {
    let features = FeatureConfig {
      enable_password_auth: env_bool("ENABLE_PASSWORD_AUTH", true),
      enable_oauth: env_bool("ENABLE_OAUTH", false),
      require_email_verification: env_bool("REQUIRE_EMAIL_VERIFICATION", false),
    };

    let auth = AuthConfig {
      token_signing_secret: required("TOKEN_SIGNING_SECRET")?,
      access_token_expiry_secs: env_i64("ACCESS_TOKEN_EXPIRY", 900),
      refresh_token_expiry_secs: env_i64("REFRESH_TOKEN_EXPIRY", 2_592_000),
      reset_token_expiry_secs: env_i64("RESET_TOKEN_EXPIRY", 3_600),
      password_hash_cost: env_u32("PASSWORD_HASH_COST", 12),
      max_login_attempts: env_i64("MAX_LOGIN_ATTEMPTS", 5) as i32,
      lockout_duration_secs: env_i64("LOCKOUT_DURATION", 1_800),
    };

    let oauth = if features.enable_oauth {
      OAuthConfig {
        client_id: required("OAUTH_CLIENT_ID")?,
        client_secret: required("OAUTH_CLIENT_SECRET")?,
        auth_url: env_string(
          "OAUTH_AUTH_URL",
          "https://accounts.google.com/o/oauth2/v2/auth",
        ),
        token_url: env_string("OAUTH_TOKEN_URL", "https://oauth2.googleapis.com/token"),
        jwks_url: env_string(
          "OAUTH_JWKS_URL",
          "https://www.googleapis.com/oauth2/v3/certs",
        ),
        allowed_issuers: env_list(
          "OAUTH_ALLOWED_ISSUERS",
          &["https://accounts.google.com", "accounts.google.com"],
        ),
        redirect_port: env_u32("OAUTH_REDIRECT_PORT", 3000) as u16,
        scope: env_string("OAUTH_SCOPE", "openid email profile"),
        callback_timeout_secs: env_u64("OAUTH_CALLBACK_TIMEOUT", 300),
      }
    } else {
      OAuthConfig::disabled()
    };

    let config = Self {
      database: DatabaseConfig {
        url: required("DATABASE_URL")?,
        max_connections: env_u32("DATABASE_MAX_CONNECTIONS", 10),
        connect_timeout_secs: env_u64("DATABASE_CONNECT_TIMEOUT", 10),
        socket_timeout_secs: env_u64("DATABASE_SOCKET_TIMEOUT", 30),
        health_check_interval_secs: env_u64("DATABASE_HEALTH_CHECK_INTERVAL", 30),
        max_consecutive_failures: env_u32("DATABASE_MAX_CONSECUTIVE_FAILURES", 3),
      },
      auth,
      oauth,
      features,
      camera: CameraConfig {
        base_url: env_string("CAMERA_SERVER_URL", "https://raspberrypi.local:5000"),
        api_key: env::var("CAMERA_API_KEY").ok().filter(|v| !v.is_empty()),
        failure_threshold: env_u32("CIRCUIT_FAILURE_THRESHOLD", 5),
        cooldown_secs: env_u64("CIRCUIT_COOLDOWN", 60),
        availability_cache_ttl_secs: env_u64("CAMERA_AVAILABILITY_TTL", 60),
      },
      cache: CacheConfig {
        root: env_path("CACHE_ROOT", ".cache/pantrykit"),
        ttl_hours: env_i64("CACHE_TTL_HOURS", 12),
      },
      external_sessions: ExternalSessionConfig {
        base_dir: env_path("EXTERNAL_SESSION_DIR", ".cache/pantrykit/blinkit_sessions"),
        ttl_days: env_i64("EXTERNAL_SESSION_TTL_DAYS", 7),
      },
      rate_limits: RateLimitConfig {
        login_per_15_min: env_u32("RATE_LIMIT_LOGIN", 5),
        password_reset_per_hour: env_u32("RATE_LIMIT_PASSWORD_RESET", 3),
        token_refresh_per_minute: env_u32("RATE_LIMIT_TOKEN_REFRESH", 10),
      },
      observability: ObservabilityConfig {
        log_level: env_string("LOG_LEVEL", "info"),
      },
    };

    config.validate()?;
    Ok(config)
  }

  /// Reject configurations an operator should never run with.
  pub fn validate(&self) -> Result<(), AppError> {
    if self.auth.token_signing_secret.len() < pantrykit_core::token::MIN_SECRET_BYTES {
      return Err(AppError::ConfigMissing(format!(
        "TOKEN_SIGNING_SECRET must be at least {} bytes",
        pantrykit_core::token::MIN_SECRET_BYTES
      )));
    }

    if self.auth.password_hash_cost < 10 {
      return Err(AppError::ConfigMissing(
        "PASSWORD_HASH_COST must be at least 10".to_string(),
      ));
    }

    if self.auth.max_login_attempts < 3 {
      return Err(AppError::ConfigMissing(
        "MAX_LOGIN_ATTEMPTS should be at least 3".to_string(),
      ));
    }

    if self.features.enable_oauth && self.oauth.client_id.is_empty() {
      return Err(AppError::ConfigMissing(
        "OAUTH_CLIENT_ID is required when OAuth is enabled".to_string(),
      ));
    }

    Ok(())
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.database.connect_timeout_secs)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.database.health_check_interval_secs)
  }
}

impl OAuthConfig {
  fn disabled() -> Self {
    Self {
      client_id: String::new(),
      client_secret: String::new(),
      auth_url: String::new(),
      token_url: String::new(),
      jwks_url: String::new(),
      allowed_issuers: vec![],
      redirect_port: 3000,
      scope: String::new(),
      callback_timeout_secs: 300,
    }
  }
}

fn required(key: &str) -> Result<String, AppError> {
  env::var(key)
    .ok()
    .filter(|v| !v.is_empty())
    .ok_or_else(|| AppError::ConfigMissing(format!("{} is required", key)))
}

fn env_string(key: &str, default: &str) -> String {
  env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
  env::var(key)
    .ok()
    .map(|v| v.to_lowercase() == "true" || v == "1")
    .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
  env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
  env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
  env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
  env::var(key)
    .ok()
    .filter(|v| !v.is_empty())
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from(default))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
  env::var(key)
    .ok()
    .filter(|v| !v.is_empty())
    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
    .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base_config() -> AppConfig {
    AppConfig {
      database: DatabaseConfig {
        url: "postgres://localhost/pantrykit".to_string(),
        max_connections: 10,
        connect_timeout_secs: 10,
        socket_timeout_secs: 30,
        health_check_interval_secs: 30,
        max_consecutive_failures: 3,
      },
      auth: AuthConfig {
        token_signing_secret: "0123456789abcdef0123456789abcdef".to_string(),
        access_token_expiry_secs: 900,
        refresh_token_expiry_secs: 2_592_000,
        reset_token_expiry_secs: 3_600,
        password_hash_cost: 12,
        max_login_attempts: 5,
        lockout_duration_secs: 1_800,
      },
      oauth: OAuthConfig::disabled(),
      features: FeatureConfig {
        enable_password_auth: true,
        enable_oauth: false,
        require_email_verification: false,
      },
      camera: CameraConfig {
        base_url: "https://camera.local:5000".to_string(),
        api_key: None,
        failure_threshold: 5,
        cooldown_secs: 60,
        availability_cache_ttl_secs: 60,
      },
      cache: CacheConfig {
        root: PathBuf::from("/tmp/cache"),
        ttl_hours: 12,
      },
      external_sessions: ExternalSessionConfig {
        base_dir: PathBuf::from("/tmp/sessions"),
        ttl_days: 7,
      },
      rate_limits: RateLimitConfig {
        login_per_15_min: 5,
        password_reset_per_hour: 3,
        token_refresh_per_minute: 10,
      },
      observability: ObservabilityConfig {
        log_level: "info".to_string(),
      },
    }
  }

  #[test]
  fn valid_config_passes() {
    assert!(base_config().validate().is_ok());
  }

  #[test]
  fn short_secret_is_fatal() {
    let mut config = base_config();
    config.auth.token_signing_secret = "short".to_string();
    assert!(matches!(
      config.validate(),
      Err(AppError::ConfigMissing(_))
    ));
  }

  #[test]
  fn weak_hash_cost_is_fatal() {
    let mut config = base_config();
    config.auth.password_hash_cost = 8;
    assert!(matches!(
      config.validate(),
      Err(AppError::ConfigMissing(_))
    ));
  }

  #[test]
  fn oauth_enabled_requires_client_id() {
    let mut config = base_config();
    config.features.enable_oauth = true;
    assert!(matches!(
      config.validate(),
      Err(AppError::ConfigMissing(_))
    ));
  }
}
