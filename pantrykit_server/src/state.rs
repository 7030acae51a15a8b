//! Application state: the documented singletons, created once at startup,
//! handed to consumers by injection, and torn down in reverse construction
//! order.

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pantrykit_core::contracts::RequestContext;
use pantrykit_core::error::CoreError;
use pantrykit_core::token::{TokenLifetimes, TokenService};

use crate::config::AppConfig;
use crate::database::{sweeper, ConnectionStateMachine, PoolFactory};
use crate::domains::auth::providers::{OAuthProvider, PasswordProvider};
use crate::domains::auth::{AuditRepositoryImpl, SessionRepositoryImpl};
use crate::domains::grocery::GroceryListRepositoryImpl;
use crate::domains::user::UserRepositoryImpl;
use crate::error::AppError;
use crate::migrations;
use crate::services::artifact_cache::ArtifactCache;
use crate::services::auth_service::AuthService;
use crate::services::camera::CameraClient;
use crate::services::ordering::{ListNormalizer, OrderingOrchestrator};
use crate::services::session_registry::{DriverFactory, ExternalSessionRegistry, SessionStore};

pub struct AppState {
  config: AppConfig,
  db: Arc<ConnectionStateMachine>,
  token_service: Arc<TokenService>,
  auth: Arc<AuthService>,
  registry: Arc<ExternalSessionRegistry>,
  cache: Arc<ArtifactCache>,
  camera: Arc<CameraClient>,
  orchestrator: Arc<OrderingOrchestrator>,
  grocery: Arc<GroceryListRepositoryImpl>,
  maintenance: Option<JoinHandle<()>>,
  shutdown_tx: watch::Sender<bool>,
}

impl AppState {
  /// Wire everything up. The automation-driver factory and the list
  /// normalizer are external collaborators and come in from the caller.
  pub async fn try_new(
    config: AppConfig,
    driver_factory: DriverFactory,
    normalizer: Arc<dyn ListNormalizer>,
  ) -> Result<Self, AppError> {
    config.validate()?;

    let db = ConnectionStateMachine::new(
      pool_factory(&config),
      config.health_check_interval(),
    );
    let pool = db.ensure_connected(3).await?;
    migrations::run_migrations(&pool).await?;

    let users = Arc::new(UserRepositoryImpl::new(pool.clone()));
    let sessions = Arc::new(SessionRepositoryImpl::new(pool.clone()));
    let audit = Arc::new(AuditRepositoryImpl::new(pool.clone()));
    let grocery = Arc::new(GroceryListRepositoryImpl::new(pool.clone()));

    let token_service = Arc::new(
      TokenService::new(
        &config.auth.token_signing_secret,
        TokenLifetimes {
          access_secs: config.auth.access_token_expiry_secs,
          refresh_secs: config.auth.refresh_token_expiry_secs,
          reset_secs: config.auth.reset_token_expiry_secs,
        },
      )
      .map_err(|e| AppError::ConfigMissing(e.to_string()))?,
    );

    let mut auth = AuthService::new(
      token_service.clone(),
      users.clone(),
      sessions.clone(),
      audit.clone(),
      config.rate_limits.login_per_15_min,
    );

    if config.features.enable_password_auth {
      auth.register_password_provider(Arc::new(PasswordProvider::new(
        users.clone(),
        sessions.clone(),
        audit.clone(),
        token_service.clone(),
        config.auth.password_hash_cost,
        config.auth.max_login_attempts,
        config.auth.lockout_duration_secs,
        config.features.require_email_verification,
      )));
    }

    if config.features.enable_oauth {
      auth.register_provider(Arc::new(OAuthProvider::new(
        "google",
        config.oauth.clone(),
        users.clone(),
        audit.clone(),
      )));
    }
    let auth = Arc::new(auth);

    let store = SessionStore::new(
      &config.external_sessions.base_dir,
      config.external_sessions.ttl_days,
    )?;
    let registry = Arc::new(ExternalSessionRegistry::new(store, driver_factory));

    let cache = Arc::new(ArtifactCache::new(
      &config.cache.root,
      config.cache.ttl_hours,
    )?);

    let camera = Arc::new(CameraClient::new(&config.camera));

    let orchestrator = Arc::new(OrderingOrchestrator::new(
      registry.clone(),
      auth.clone(),
      normalizer,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = Some(spawn_maintenance(
      pool.clone(),
      cache.clone(),
      registry.clone(),
      shutdown_rx,
    ));

    info!(
      providers = ?auth.provider_names(),
      "application state initialized"
    );

    Ok(Self {
      config,
      db,
      token_service,
      auth,
      registry,
      cache,
      camera,
      orchestrator,
      grocery,
      maintenance,
      shutdown_tx,
    })
  }

  pub fn config(&self) -> &AppConfig {
    &self.config
  }

  pub fn db(&self) -> &Arc<ConnectionStateMachine> {
    &self.db
  }

  pub fn auth(&self) -> &Arc<AuthService> {
    &self.auth
  }

  pub fn registry(&self) -> &Arc<ExternalSessionRegistry> {
    &self.registry
  }

  pub fn cache(&self) -> &Arc<ArtifactCache> {
    &self.cache
  }

  pub fn camera(&self) -> &Arc<CameraClient> {
    &self.camera
  }

  pub fn orchestrator(&self) -> &Arc<OrderingOrchestrator> {
    &self.orchestrator
  }

  pub fn grocery(&self) -> &Arc<GroceryListRepositoryImpl> {
    &self.grocery
  }

  /// Application-level logout: revoke the session AND tear down the user's
  /// external automation session, live and on disk.
  pub async fn logout(&self, access_token: &str, ctx: &RequestContext) -> Result<(), AppError> {
    let claims = self.token_service.decode_unchecked(access_token)?;
    self.auth.logout(access_token, ctx).await?;
    self.registry.clear(&claims.email).await?;
    Ok(())
  }

  /// Password reset completion also invalidates the user's external
  /// sessions: fresh credentials mean a fresh automation state.
  pub async fn complete_password_reset(
    &self,
    reset_token: &str,
    new_password: &str,
    ctx: &RequestContext,
  ) -> Result<(), AppError> {
    let provider = self
      .auth
      .password_provider()
      .ok_or_else(|| {
        AppError::Core(CoreError::Validation(
          "password authentication is not enabled".to_string(),
        ))
      })?
      .clone();

    let user = provider
      .complete_password_reset(reset_token, new_password, ctx)
      .await?;
    self.registry.clear(&user.email).await?;
    Ok(())
  }

  /// Ordered teardown: automation drivers first, then background tasks, then
  /// the store connection. Errors are collected and logged, never raised
  /// over one another, and every step is bounded.
  pub async fn shutdown(mut self) {
    let mut cleanup_errors: Vec<String> = Vec::new();

    match tokio::time::timeout(Duration::from_secs(15), self.registry.shutdown()).await {
      Ok(errors) => {
        for (username, e) in errors {
          cleanup_errors.push(format!("driver close for {}: {}", username, e));
        }
      }
      Err(_) => cleanup_errors.push("automation session shutdown timed out".to_string()),
    }

    let _ = self.shutdown_tx.send(true);
    if let Some(task) = self.maintenance.take() {
      if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
        cleanup_errors.push("maintenance task did not stop within 5s".to_string());
      }
    }

    self.db.disconnect().await;

    if cleanup_errors.is_empty() {
      info!("shutdown complete");
    } else {
      for e in &cleanup_errors {
        error!(error = %e, "cleanup error");
      }
      warn!(count = cleanup_errors.len(), "shutdown completed with errors");
    }
  }
}

fn pool_factory(config: &AppConfig) -> PoolFactory {
  let url = config.database.url.clone();
  let max_connections = config.database.max_connections;
  let connect_timeout = config.connect_timeout();

  Arc::new(move || {
    let url = url.clone();
    Box::pin(async move {
      PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect(&url)
        .await
    })
  })
}

/// Hourly housekeeping: expired cache entries, expired external sessions,
/// and the database TTL sweeps.
fn spawn_maintenance(
  pool: sqlx::PgPool,
  cache: Arc<ArtifactCache>,
  registry: Arc<ExternalSessionRegistry>,
  mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
  let sweeper_rx = shutdown_rx.clone();
  let sweeper_task = sweeper::spawn_ttl_sweeper(pool, Duration::from_secs(600), sweeper_rx);

  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        _ = shutdown_rx.changed() => {}
      }
      if *shutdown_rx.borrow() {
        break;
      }

      if let Err(e) = cache.cleanup_expired().await {
        warn!(error = %e, "cache cleanup failed");
      }
      match registry.store().cleanup_expired() {
        Ok(removed) if !removed.is_empty() => {
          info!(count = removed.len(), "expired external sessions removed");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "external session cleanup failed"),
      }
    }

    let _ = sweeper_task.await;
  })
}
