//! Single-request loopback listener for the OAuth redirect.
//!
//! Serves exactly one callback, acknowledges it with a small HTML page, and
//! hands the captured parameters back over a oneshot channel. The wait is
//! bounded; shutdown can never hang the authentication flow.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::AppError;

/// What the redirect delivered.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
  Success { code: String, state: String },
  Denied { error: String },
}

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Signed in</title></head>\
  <body><h2>Authentication complete</h2>\
  <p>You can close this window and return to the app.</p></body></html>";

const ERROR_PAGE: &str = "<!DOCTYPE html><html><head><title>Sign-in failed</title></head>\
  <body><h2>Authentication failed</h2>\
  <p>The authorization response was missing or invalid. Close this window and try again.</p>\
  </body></html>";

type OutcomeSlot = Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>;

pub struct LocalCallbackServer {
  listener: TcpListener,
  local_addr: SocketAddr,
}

impl LocalCallbackServer {
  /// Bind the loopback port. Port 0 picks an ephemeral port (used by tests).
  pub async fn bind(port: u16) -> Result<Self, AppError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let local_addr = listener.local_addr()?;
    debug!(%local_addr, "oauth callback listener bound");
    Ok(Self {
      listener,
      local_addr,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Serve until one callback arrives or the timeout elapses, whichever is
  /// first. The HTTP server is shut down before returning either way.
  pub async fn wait_for_callback(self, timeout: Duration) -> Result<CallbackOutcome, AppError> {
    let (outcome_tx, outcome_rx) = oneshot::channel::<CallbackOutcome>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let slot: OutcomeSlot = Arc::new(Mutex::new(Some(outcome_tx)));

    let app = Router::new().route("/", get(handle_callback)).with_state(slot);

    let server = tokio::spawn(async move {
      let result = axum::serve(self.listener, app)
        .with_graceful_shutdown(async {
          let _ = shutdown_rx.await;
        })
        .await;
      if let Err(e) = result {
        warn!(error = %e, "callback server error");
      }
    });

    let outcome = tokio::time::timeout(timeout, outcome_rx).await;

    // Stop accepting regardless of how the wait ended.
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;

    match outcome {
      Ok(Ok(outcome)) => Ok(outcome),
      Ok(Err(_)) => Err(AppError::Internal(
        "callback channel closed unexpectedly".to_string(),
      )),
      Err(_) => Err(AppError::Timeout(format!(
        "no oauth callback within {:?}",
        timeout
      ))),
    }
  }
}

async fn handle_callback(
  State(slot): State<OutcomeSlot>,
  Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<&'static str>) {
  let outcome = if let Some(error) = params.get("error") {
    Some(CallbackOutcome::Denied {
      error: error.clone(),
    })
  } else {
    match (params.get("code"), params.get("state")) {
      (Some(code), Some(state)) => Some(CallbackOutcome::Success {
        code: code.clone(),
        state: state.clone(),
      }),
      _ => None,
    }
  };

  let Some(outcome) = outcome else {
    return (StatusCode::BAD_REQUEST, Html(ERROR_PAGE));
  };

  let status = match &outcome {
    CallbackOutcome::Success { .. } => StatusCode::OK,
    CallbackOutcome::Denied { .. } => StatusCode::BAD_REQUEST,
  };

  // Only the first request wins; later hits still get a page.
  if let Ok(mut guard) = slot.lock() {
    if let Some(tx) = guard.take() {
      let _ = tx.send(outcome);
    }
  }

  match status {
    StatusCode::OK => (StatusCode::OK, Html(SUCCESS_PAGE)),
    _ => (StatusCode::BAD_REQUEST, Html(ERROR_PAGE)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_code_and_state() -> anyhow::Result<()> {
    let server = LocalCallbackServer::bind(0).await?;
    let addr = server.local_addr();

    let wait = tokio::spawn(server.wait_for_callback(Duration::from_secs(10)));

    let resp = reqwest::get(format!(
      "http://{}/?code=auth-code-1&state=state-xyz",
      addr
    ))
    .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.text().await?.contains("Authentication complete"));

    let outcome = wait.await??;
    match outcome {
      CallbackOutcome::Success { code, state } => {
        assert_eq!(code, "auth-code-1");
        assert_eq!(state, "state-xyz");
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
    Ok(())
  }

  #[tokio::test]
  async fn error_parameter_is_a_denial() -> anyhow::Result<()> {
    let server = LocalCallbackServer::bind(0).await?;
    let addr = server.local_addr();

    let wait = tokio::spawn(server.wait_for_callback(Duration::from_secs(10)));

    let resp = reqwest::get(format!("http://{}/?error=access_denied", addr)).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let outcome = wait.await??;
    assert!(matches!(
      outcome,
      CallbackOutcome::Denied { error } if error == "access_denied"
    ));
    Ok(())
  }

  #[tokio::test]
  async fn missing_parameters_get_400_and_keep_waiting() -> anyhow::Result<()> {
    let server = LocalCallbackServer::bind(0).await?;
    let addr = server.local_addr();

    let wait = tokio::spawn(server.wait_for_callback(Duration::from_millis(500)));

    let resp = reqwest::get(format!("http://{}/?state=only-state", addr)).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // No valid callback ever arrives, so the bounded wait times out.
    let result = wait.await?;
    assert!(matches!(result, Err(AppError::Timeout(_))));
    Ok(())
  }
}
