//! Per-user external-service session isolation.
//!
//! Two parts: an on-disk store of persisted automation sessions (one
//! directory per user, owner-only permissions) and an in-memory registry of
//! live driver instances. Two distinct usernames never share a driver, and
//! `get`/`clear` for the same user are serialized by one lock.

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::services::ordering::driver::AutomationDriver;

pub const AUTH_STATE_FILE: &str = "auth_state";
pub const METADATA_FILE: &str = "metadata.json";

/// Keep `[A-Za-z0-9_-]`, lowercase. Distinct inputs can collide only if they
/// differ in stripped characters; the registry keys on the sanitized form.
pub fn sanitize_username(username: &str) -> String {
  username
    .chars()
    .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
    .collect::<String>()
    .to_lowercase()
}

/// One-way phone fingerprint; the raw number is never written to disk.
pub fn hash_phone(phone: &str) -> String {
  hex::encode(Sha256::digest(phone.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
  pub created_at: DateTime<Utc>,
  pub last_used_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone_hash: Option<String>,
}

/// On-disk session store: `<base>/<sanitized_username>/{auth_state, metadata.json}`.
pub struct SessionStore {
  base_dir: PathBuf,
  ttl: Duration,
}

impl SessionStore {
  pub fn new(base_dir: impl Into<PathBuf>, ttl_days: i64) -> Result<Self, AppError> {
    let base_dir = base_dir.into();
    std::fs::create_dir_all(&base_dir)?;
    restrict_dir(&base_dir)?;
    Ok(Self {
      base_dir,
      ttl: Duration::days(ttl_days),
    })
  }

  fn user_dir(&self, username: &str) -> PathBuf {
    self.base_dir.join(sanitize_username(username))
  }

  fn metadata_path(&self, username: &str) -> PathBuf {
    self.user_dir(username).join(METADATA_FILE)
  }

  /// The path handed to the automation library for persisted credentials.
  pub fn auth_state_path(&self, username: &str) -> PathBuf {
    self.user_dir(username).join(AUTH_STATE_FILE)
  }

  /// A session exists only when BOTH files are present; a half-written
  /// directory counts as absent.
  pub fn exists(&self, username: &str) -> bool {
    self.metadata_path(username).exists() && self.auth_state_path(username).exists()
  }

  pub fn is_valid(&self, username: &str) -> bool {
    if !self.exists(username) {
      return false;
    }
    match self.read_metadata(username) {
      Ok(meta) => Utc::now() < meta.expires_at,
      Err(_) => false,
    }
  }

  /// Create (or reset) the per-user session directory with owner-only
  /// permissions and a fresh TTL window.
  pub fn create(&self, username: &str, phone: Option<&str>) -> Result<SessionMetadata, AppError> {
    let dir = self.user_dir(username);
    std::fs::create_dir_all(&dir)?;
    restrict_dir(&dir)?;

    let now = Utc::now();
    let metadata = SessionMetadata {
      created_at: now,
      last_used_at: now,
      expires_at: now + self.ttl,
      phone_hash: phone.map(hash_phone),
    };

    // The automation library owns the auth-state contents; an empty file
    // marks the slot and carries the restrictive mode from the start.
    let auth_path = self.auth_state_path(username);
    if !auth_path.exists() {
      std::fs::write(&auth_path, b"")?;
    }
    restrict_file(&auth_path)?;

    self.write_metadata(username, &metadata)?;
    info!(username = %sanitize_username(username), "external session created");
    Ok(metadata)
  }

  pub fn touch_activity(&self, username: &str) -> Result<(), AppError> {
    let mut meta = self.read_metadata(username)?;
    meta.last_used_at = Utc::now();
    self.write_metadata(username, &meta)
  }

  pub fn read_metadata(&self, username: &str) -> Result<SessionMetadata, AppError> {
    let bytes = std::fs::read(self.metadata_path(username))?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  fn write_metadata(&self, username: &str, metadata: &SessionMetadata) -> Result<(), AppError> {
    let path = self.metadata_path(username);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
    restrict_file(&tmp)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
  }

  /// Remove the whole per-user directory. Idempotent.
  pub fn clear(&self, username: &str) -> Result<(), AppError> {
    let dir = self.user_dir(username);
    if dir.exists() {
      std::fs::remove_dir_all(&dir)?;
      info!(username = %sanitize_username(username), "external session cleared");
    }
    Ok(())
  }

  /// Drop sessions past their TTL. Returns the usernames removed.
  pub fn cleanup_expired(&self) -> Result<Vec<String>, AppError> {
    let mut removed = Vec::new();
    for username in self.list_all()? {
      if !self.is_valid(&username) {
        self.clear(&username)?;
        removed.push(username);
      }
    }
    Ok(removed)
  }

  pub fn list_all(&self) -> Result<Vec<String>, AppError> {
    let mut users = Vec::new();
    for entry in std::fs::read_dir(&self.base_dir)? {
      let entry = entry?;
      if entry.file_type()?.is_dir() {
        if let Some(name) = entry.file_name().to_str() {
          users.push(name.to_string());
        }
      }
    }
    users.sort();
    Ok(users)
  }
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<(), AppError> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
  Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<(), AppError> {
  Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<(), AppError> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
  Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<(), AppError> {
  Ok(())
}

/// Factory producing a driver bound to one user's auth-state path.
pub type DriverFactory = Arc<
  dyn Fn(PathBuf) -> BoxFuture<'static, Result<Arc<dyn AutomationDriver>, AppError>>
    + Send
    + Sync,
>;

/// In-memory registry of live drivers plus the on-disk store behind them.
pub struct ExternalSessionRegistry {
  store: SessionStore,
  live: Mutex<HashMap<String, Arc<dyn AutomationDriver>>>,
  factory: DriverFactory,
}

impl ExternalSessionRegistry {
  pub fn new(store: SessionStore, factory: DriverFactory) -> Self {
    Self {
      store,
      live: Mutex::new(HashMap::new()),
      factory,
    }
  }

  pub fn store(&self) -> &SessionStore {
    &self.store
  }

  /// Idempotent: the same username always gets the same live driver until it
  /// is cleared; distinct usernames always get distinct drivers.
  pub async fn get(&self, username: &str) -> Result<Arc<dyn AutomationDriver>, AppError> {
    let key = sanitize_username(username);
    let mut live = self.live.lock().await;

    if let Some(driver) = live.get(&key) {
      let _ = self.store.touch_activity(&key);
      return Ok(driver.clone());
    }

    if !self.store.is_valid(&key) {
      self.store.create(&key, None)?;
    }

    let driver = (self.factory)(self.store.auth_state_path(&key)).await?;
    live.insert(key.clone(), driver.clone());
    debug!(username = %key, "driver bound to session");
    Ok(driver)
  }

  /// Close the live driver (if any) and remove the on-disk session, both
  /// under the registry lock. Idempotent.
  pub async fn clear(&self, username: &str) -> Result<(), AppError> {
    let key = sanitize_username(username);
    let mut live = self.live.lock().await;

    if let Some(driver) = live.remove(&key) {
      if let Err(e) = driver.close().await {
        warn!(username = %key, error = %e, "driver close failed during clear");
      }
    }

    self.store.clear(&key)
  }

  pub async fn active_users(&self) -> Vec<String> {
    let live = self.live.lock().await;
    let mut users: Vec<String> = live.keys().cloned().collect();
    users.sort();
    users
  }

  /// Ordered teardown for process exit: every driver is closed before the
  /// disk state is considered settled. Errors are collected, not raised over
  /// one another.
  pub async fn shutdown(&self) -> Vec<(String, AppError)> {
    let mut live = self.live.lock().await;
    let mut errors = Vec::new();
    for (username, driver) in live.drain() {
      if let Err(e) = driver.close().await {
        errors.push((username, e));
      }
    }
    errors
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::services::ordering::test_support::MockDriver;
  use tempfile::TempDir;

  fn factory(counter: Arc<std::sync::atomic::AtomicUsize>) -> DriverFactory {
    Arc::new(move |auth_path: PathBuf| {
      let counter = counter.clone();
      Box::pin(async move {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(Arc::new(MockDriver::healthy(auth_path)) as Arc<dyn AutomationDriver>)
      })
    })
  }

  #[test]
  fn sanitization_keeps_safe_characters_only() {
    assert_eq!(sanitize_username("Alice"), "alice");
    assert_eq!(sanitize_username("bob.smith@example"), "bobsmithexample");
    assert_eq!(sanitize_username("we_ird--User"), "we_ird--user");
  }

  #[test]
  fn phone_is_stored_hashed_only() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    store.create("alice", Some("+91-9876543210"))?;

    let meta = store.read_metadata("alice")?;
    let hash = meta.phone_hash.expect("phone hash recorded");
    assert_ne!(hash, "+91-9876543210");
    assert!(!hash.contains("9876"));

    let raw = std::fs::read_to_string(dir.path().join("alice").join(METADATA_FILE))?;
    assert!(!raw.contains("9876543210"));
    Ok(())
  }

  #[test]
  fn ttl_governs_validity() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    let meta = store.create("alice", None)?;
    assert!(store.is_valid("alice"));
    assert_eq!(meta.expires_at, meta.created_at + Duration::days(7));

    // Zero-TTL store: freshly created is already expired.
    let store = SessionStore::new(dir.path(), 0)?;
    store.create("bob", None)?;
    assert!(store.exists("bob"));
    assert!(!store.is_valid("bob"));

    let removed = store.cleanup_expired()?;
    assert!(removed.contains(&"bob".to_string()));
    assert!(!store.exists("bob"));
    Ok(())
  }

  #[cfg(unix)]
  #[test]
  fn directory_and_files_are_owner_only() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    store.create("alice", None)?;

    let dir_mode = std::fs::metadata(dir.path().join("alice"))?.permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o700);

    let file_mode = std::fs::metadata(store.auth_state_path("alice"))?
      .permissions()
      .mode();
    assert_eq!(file_mode & 0o777, 0o600);
    Ok(())
  }

  #[tokio::test]
  async fn distinct_users_get_distinct_drivers_and_paths() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let registry = ExternalSessionRegistry::new(store, factory(counter.clone()));

    let alice = registry.get("alice").await?;
    let bob = registry.get("bob").await?;

    assert!(!Arc::ptr_eq(&alice, &bob));
    assert_ne!(
      registry.store().auth_state_path("alice"),
      registry.store().auth_state_path("bob")
    );
    assert!(registry
      .store()
      .auth_state_path("alice")
      .starts_with(dir.path().join("alice")));
    assert_eq!(registry.active_users().await, vec!["alice", "bob"]);
    Ok(())
  }

  #[tokio::test]
  async fn get_is_idempotent_per_user() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let registry = ExternalSessionRegistry::new(store, factory(counter.clone()));

    let first = registry.get("alice").await?;
    let second = registry.get("alice").await?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    Ok(())
  }

  #[tokio::test]
  async fn clear_is_isolated_and_idempotent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let registry = ExternalSessionRegistry::new(store, factory(counter.clone()));

    let _ = registry.get("alice").await?;
    let _ = registry.get("bob").await?;

    registry.clear("alice").await?;
    registry.clear("alice").await?; // idempotent

    assert!(!registry.store().exists("alice"));
    assert!(registry.store().exists("bob"));
    assert_eq!(registry.active_users().await, vec!["bob"]);

    // A fresh get after clear builds a NEW driver, never the cached one.
    let _ = registry.get("alice").await?;
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    Ok(())
  }

  #[tokio::test]
  async fn shutdown_closes_every_live_driver() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = SessionStore::new(dir.path(), 7)?;
    let shared = Arc::new(MockDriver::healthy(dir.path().join("alice")));
    let for_factory = shared.clone();
    let factory: DriverFactory = Arc::new(move |_path: PathBuf| {
      let driver = for_factory.clone();
      Box::pin(async move { Ok(driver as Arc<dyn AutomationDriver>) })
    });
    let registry = ExternalSessionRegistry::new(store, factory);

    let _ = registry.get("alice").await?;
    let errors = registry.shutdown().await;

    assert!(errors.is_empty());
    assert_eq!(shared.close_count(), 1);
    assert!(registry.active_users().await.is_empty());
    Ok(())
  }
}
