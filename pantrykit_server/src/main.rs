//! Process entry point: configuration, state wiring, the supervision loop,
//! and ordered teardown with the documented exit codes.

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pantrykit_server::config::AppConfig;
use pantrykit_server::error::AppError;
use pantrykit_server::services::ordering::PassthroughNormalizer;
use pantrykit_server::services::session_registry::DriverFactory;
use pantrykit_server::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
  let config = match AppConfig::load() {
    Ok(config) => config,
    Err(e) => {
      eprintln!("fatal: {}", e);
      return ExitCode::from(1);
    }
  };

  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer())
    .with(tracing_subscriber::EnvFilter::new(
      &config.observability.log_level,
    ))
    .init();

  let state = match AppState::try_new(config, unbound_driver_factory(), Arc::new(PassthroughNormalizer)).await
  {
    Ok(state) => state,
    Err(e) => {
      error!(error = %e, "startup failed");
      return ExitCode::from(1);
    }
  };

  info!("pantrykit started");
  let exit = supervise(&state).await;
  state.shutdown().await;
  exit
}

/// The real browser driver comes from the automation library; a process
/// without one configured refuses ordering rather than crashing elsewhere.
fn unbound_driver_factory() -> DriverFactory {
  Arc::new(|_auth_state_path| {
    Box::pin(async {
      Err(AppError::ServiceUnavailable(
        "no automation driver configured".to_string(),
      ))
    })
  })
}

/// Watch the store connection until shutdown is requested. Consecutive
/// connection failures past the configured threshold are a critical error:
/// exit code 1.
async fn supervise(state: &AppState) -> ExitCode {
  let max_failures = state.config().database.max_consecutive_failures.max(1);
  let interval = state.config().health_check_interval();
  let mut consecutive_failures: u32 = 0;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("shutdown requested");
        return ExitCode::from(0);
      }
      _ = tokio::time::sleep(interval) => {}
    }

    match state.db().ensure_connected(1).await {
      Ok(_) => {
        if consecutive_failures > 0 {
          info!(after = consecutive_failures, "store connection recovered");
        }
        consecutive_failures = 0;
      }
      Err(AppError::ConnectionFailed(e)) => {
        consecutive_failures += 1;
        warn!(
          error = %e,
          consecutive_failures,
          remaining = max_failures.saturating_sub(consecutive_failures),
          "store connection failed"
        );
        if consecutive_failures >= max_failures {
          error!(
            consecutive_failures,
            "store unavailable for too long, exiting"
          );
          return ExitCode::from(1);
        }
      }
      Err(e) => {
        warn!(error = %e, "health supervision error");
      }
    }

    // Opportunistic metrics visibility at a low cadence.
    let metrics = state.db().metrics().await;
    if metrics.connection_failures > 0 {
      tracing::debug!(
        attempts = metrics.connection_attempts,
        failures = metrics.connection_failures,
        success_rate = metrics.success_rate(),
        "connection metrics"
      );
    }
  }
}
