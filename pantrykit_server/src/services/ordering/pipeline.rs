//! The ordering pipeline: normalize → bind session → authorize → add items →
//! verify cart → optional checkout.
//!
//! Cancellation is observed between stages and between items; a cancelled
//! run never leaves a half-driven checkout behind.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use pantrykit_core::contracts::RequestContext;
use pantrykit_core::error::{AuthFailureReason, CoreError};
use pantrykit_core::models::{dedupe_items, GroceryItem};

use crate::error::AppError;
use crate::services::auth_service::AuthService;
use crate::services::session_registry::{sanitize_username, ExternalSessionRegistry};

use super::driver::{AutomationDriver, SavedOption};
use super::ranking::{rank_candidates, RankingContext, SIMILARITY_FLOOR};

const ITEM_PACING: Duration = Duration::from_secs(1);
const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_SPACING: Duration = Duration::from_secs(2);
const LOGIN_CHECK_TTL: Duration = Duration::from_secs(5 * 60);
const TOP_N_VARIANTS: usize = 3;

/// Best-effort normalization of a raw list into canonical atoms. The AI
/// collaborator sits behind this seam; the pipeline falls back to the raw
/// list when it fails.
#[async_trait]
pub trait ListNormalizer: Send + Sync {
  async fn normalize(&self, raw: &[GroceryItem]) -> Result<Vec<GroceryItem>, AppError>;
}

/// Default normalizer: no transformation beyond deduplication.
pub struct PassthroughNormalizer;

#[async_trait]
impl ListNormalizer for PassthroughNormalizer {
  async fn normalize(&self, raw: &[GroceryItem]) -> Result<Vec<GroceryItem>, AppError> {
    Ok(raw.to_vec())
  }
}

#[derive(Debug, Clone)]
pub struct CheckoutSelection {
  pub address_index: usize,
  pub payment_index: usize,
}

#[derive(Debug, Clone)]
pub struct OrderingRequest {
  pub username: String,
  pub access_token: String,
  pub items: Vec<GroceryItem>,
  pub ranking: RankingContext,
  /// `None` leaves the cart filled but unsubmitted.
  pub checkout: Option<CheckoutSelection>,
}

#[derive(Debug, Clone)]
pub struct AddedItem {
  pub requested: String,
  pub product_name: String,
  pub product_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  SearchFailed,
  NoSimilarMatch,
  AddFailed,
}

#[derive(Debug, Clone)]
pub struct FailedItem {
  pub requested: String,
  pub kind: FailureKind,
  pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
  pub address: SavedOption,
  pub payment: SavedOption,
  pub submitted_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderingReport {
  pub normalized_items: Vec<GroceryItem>,
  pub added: Vec<AddedItem>,
  pub failed: Vec<FailedItem>,
  pub cart_verified: bool,
  pub checkout: Option<CheckoutOutcome>,
}

pub struct OrderingOrchestrator {
  registry: Arc<ExternalSessionRegistry>,
  auth: Arc<AuthService>,
  normalizer: Arc<dyn ListNormalizer>,
  /// Positive external-login checks, cached per user.
  login_checks: DashMap<String, Instant>,
  /// One ordering at a time per user; a second caller waits for the first.
  user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OrderingOrchestrator {
  pub fn new(
    registry: Arc<ExternalSessionRegistry>,
    auth: Arc<AuthService>,
    normalizer: Arc<dyn ListNormalizer>,
  ) -> Self {
    Self {
      registry,
      auth,
      normalizer,
      login_checks: DashMap::new(),
      user_locks: DashMap::new(),
    }
  }

  #[instrument(skip_all, fields(username = %sanitize_username(&request.username)))]
  pub async fn run(
    &self,
    request: OrderingRequest,
    ctx: &RequestContext,
    cancel: &CancellationToken,
  ) -> Result<OrderingReport, AppError> {
    let username = sanitize_username(&request.username);
    let user_lock = self
      .user_locks
      .entry(username.clone())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone();
    let _guard = user_lock.lock().await;

    // Stage 1: preprocess. The normalizer is best-effort.
    let normalized = match self.normalizer.normalize(&request.items).await {
      Ok(items) => items,
      Err(e) => {
        warn!(error = %e, "list normalization failed, using raw list");
        request.items.clone()
      }
    };
    let atoms = dedupe_items(normalized);
    if atoms.is_empty() {
      return Err(AppError::Validation("grocery list is empty".to_string()));
    }
    self.check_cancelled(cancel)?;

    // Stage 2: bind the per-user automation session.
    let driver = self.bind_session(&username).await?;
    self.check_cancelled(cancel)?;

    // Stage 3: authorize, app-level and storefront-level.
    self.authorize(&username, &request.access_token, &driver, ctx).await?;
    self.check_cancelled(cancel)?;

    // Stage 4: add each atom.
    let (added, failed) = self
      .add_items(&driver, &atoms, &request.ranking, cancel)
      .await?;
    if added.is_empty() {
      // Nothing made it into the cart: distinguish "the store had nothing
      // resembling these products" from mechanical add failures.
      if failed.iter().all(|f| f.kind == FailureKind::NoSimilarMatch) {
        return Err(AppError::ProductVerificationFailed(format!(
          "no result matched any of the {} requested items",
          failed.len()
        )));
      }
      return Err(AppError::CartVerificationFailed(format!(
        "no items could be added ({} failures)",
        failed.len()
      )));
    }

    // Stage 5: verify the cart actually holds something.
    let cart_verified = self.verify_cart(&driver, &added).await?;
    self.check_cancelled(cancel)?;

    // Stage 6: optional checkout.
    let checkout = match &request.checkout {
      Some(selection) => Some(self.checkout(&driver, selection).await?),
      None => None,
    };

    let _ = self.registry.store().touch_activity(&username);

    Ok(OrderingReport {
      normalized_items: atoms,
      added,
      failed,
      cart_verified,
      checkout,
    })
  }

  fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), AppError> {
    if cancel.is_cancelled() {
      return Err(AppError::Timeout("ordering cancelled".to_string()));
    }
    Ok(())
  }

  /// Retrieve or create the driver; a dead page is rebuilt once, then the
  /// run gives up.
  async fn bind_session(&self, username: &str) -> Result<Arc<dyn AutomationDriver>, AppError> {
    let driver = self.registry.get(username).await?;

    if driver.is_page_live().await {
      return Ok(driver);
    }

    warn!(username, "automation page dead, reinitializing once");
    driver.reinitialize().await.map_err(|e| {
      AppError::ServiceUnavailable(format!("automation session could not be rebuilt: {}", e))
    })?;

    if !driver.is_page_live().await {
      return Err(AppError::ServiceUnavailable(
        "automation page still dead after reinitialization".to_string(),
      ));
    }
    Ok(driver)
  }

  async fn authorize(
    &self,
    username: &str,
    access_token: &str,
    driver: &Arc<dyn AutomationDriver>,
    _ctx: &RequestContext,
  ) -> Result<(), AppError> {
    let session = self.auth.validate_session(access_token).await?;
    if session.is_none() {
      return Err(AppError::Core(CoreError::SessionRevoked));
    }

    if let Some(checked) = self.login_checks.get(username) {
      if checked.elapsed() < LOGIN_CHECK_TTL {
        debug!(username, "external login check cached");
        return Ok(());
      }
    }

    if !driver.is_logged_in().await? {
      return Err(AppError::Core(CoreError::AuthFailed(
        AuthFailureReason::InvalidCredentials,
      )));
    }
    self.login_checks.insert(username.to_string(), Instant::now());
    Ok(())
  }

  /// search → rank → try the top variants in order, pacing between items.
  async fn add_items(
    &self,
    driver: &Arc<dyn AutomationDriver>,
    atoms: &[GroceryItem],
    ranking: &RankingContext,
    cancel: &CancellationToken,
  ) -> Result<(Vec<AddedItem>, Vec<FailedItem>), AppError> {
    let mut added = Vec::new();
    let mut failed = Vec::new();

    for (idx, atom) in atoms.iter().enumerate() {
      self.check_cancelled(cancel)?;
      if idx > 0 {
        tokio::time::sleep(ITEM_PACING).await;
      }

      let candidates = match driver.search(&atom.item_name).await {
        Ok(candidates) => candidates,
        Err(e) => {
          failed.push(FailedItem {
            requested: atom.item_name.clone(),
            kind: FailureKind::SearchFailed,
            reason: format!("search failed: {}", e),
          });
          continue;
        }
      };

      let ranked = rank_candidates(&atom.item_name, candidates, ranking);
      let viable: Vec<_> = ranked
        .into_iter()
        .filter(|s| s.similarity >= SIMILARITY_FLOOR)
        .take(TOP_N_VARIANTS)
        .collect();

      if viable.is_empty() {
        failed.push(FailedItem {
          requested: atom.item_name.clone(),
          kind: FailureKind::NoSimilarMatch,
          reason: "no sufficiently similar product found".to_string(),
        });
        continue;
      }

      let mut item_added = false;
      for scored in &viable {
        match driver.add_to_cart(&scored.candidate).await {
          Ok(()) => {
            info!(
              item = %atom.item_name,
              product = %scored.candidate.name,
              "added to cart"
            );
            added.push(AddedItem {
              requested: atom.item_name.clone(),
              product_name: scored.candidate.name.clone(),
              product_id: scored.candidate.product_id.clone(),
            });
            item_added = true;
            break;
          }
          Err(e) => {
            debug!(
              product = %scored.candidate.name,
              error = %e,
              "variant add failed, trying next"
            );
          }
        }
      }

      if !item_added {
        failed.push(FailedItem {
          requested: atom.item_name.clone(),
          kind: FailureKind::AddFailed,
          reason: format!("all {} ranked variants failed to add", viable.len()),
        });
      }
    }

    Ok((added, failed))
  }

  /// Orthogonal strategies, retried with spacing. Any one strategy
  /// succeeding confirms the cart.
  async fn verify_cart(
    &self,
    driver: &Arc<dyn AutomationDriver>,
    added: &[AddedItem],
  ) -> Result<bool, AppError> {
    for attempt in 1..=VERIFY_ATTEMPTS {
      if let Some(bill) = driver.cart_bill_text().await? {
        if !bill.trim().is_empty() {
          debug!(attempt, "cart verified via bill text");
          return Ok(true);
        }
      }

      if driver.cart_item_count().await? > 0 {
        debug!(attempt, "cart verified via item containers");
        return Ok(true);
      }

      if matches!(driver.cart_badge_count().await?, Some(n) if n > 0) {
        debug!(attempt, "cart verified via badge count");
        return Ok(true);
      }

      let visible = driver.visible_product_names().await?;
      if added.iter().any(|a| {
        visible
          .iter()
          .any(|v| v.eq_ignore_ascii_case(&a.product_name))
      }) {
        debug!(attempt, "cart verified via visible product names");
        return Ok(true);
      }

      if attempt < VERIFY_ATTEMPTS {
        tokio::time::sleep(VERIFY_SPACING).await;
      }
    }

    Err(AppError::CartVerificationFailed(format!(
      "all strategies exhausted after {} attempts",
      VERIFY_ATTEMPTS
    )))
  }

  async fn checkout(
    &self,
    driver: &Arc<dyn AutomationDriver>,
    selection: &CheckoutSelection,
  ) -> Result<CheckoutOutcome, AppError> {
    let addresses = driver.saved_addresses().await?;
    let address = addresses
      .get(selection.address_index)
      .cloned()
      .ok_or_else(|| {
        AppError::Validation(format!(
          "address index {} out of range ({} saved)",
          selection.address_index,
          addresses.len()
        ))
      })?;

    let payments = driver.saved_payment_methods().await?;
    let payment = payments
      .get(selection.payment_index)
      .cloned()
      .ok_or_else(|| {
        AppError::Validation(format!(
          "payment index {} out of range ({} saved)",
          selection.payment_index,
          payments.len()
        ))
      })?;

    driver.submit_order(&address.id, &payment.id).await?;
    info!(address = %address.label, "order submitted");

    Ok(CheckoutOutcome {
      address,
      payment,
      submitted_at: Utc::now(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domains::auth::providers::{Credentials, PasswordProvider};
  use crate::domains::auth::test_support::{InMemoryAudit, InMemorySessions, InMemoryUsers};
  use crate::services::ordering::test_support::MockDriver;
  use crate::services::session_registry::{DriverFactory, SessionStore};
  use pantrykit_core::token::{TokenLifetimes, TokenService};
  use std::path::PathBuf;
  use tempfile::TempDir;

  struct Fixture {
    orchestrator: OrderingOrchestrator,
    access_token: String,
    driver: Arc<MockDriver>,
    _dir: TempDir,
  }

  async fn fixture(driver: Arc<MockDriver>) -> Fixture {
    let users = Arc::new(InMemoryUsers::default());
    let sessions = Arc::new(InMemorySessions::default());
    let audit = Arc::new(InMemoryAudit::default());
    let token_service = Arc::new(
      TokenService::new(
        "0123456789abcdef0123456789abcdef",
        TokenLifetimes::default(),
      )
      .unwrap(),
    );
    let provider = Arc::new(PasswordProvider::new(
      users.clone(),
      sessions.clone(),
      audit.clone(),
      token_service.clone(),
      2,
      5,
      1800,
      false,
    ));
    let mut auth = AuthService::new(token_service, users, sessions, audit, 100);
    auth.register_password_provider(provider);
    let auth = Arc::new(auth);

    let ctx = RequestContext::default();
    let (_, pair) = auth
      .register_user(
        "password",
        &Credentials::Password {
          email: "alice@example.com".to_string(),
          password: "Correct-Horse-9!".to_string(),
        },
        serde_json::json!({}),
        &ctx,
      )
      .await
      .unwrap();

    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path(), 7).unwrap();
    let driver_for_factory = driver.clone();
    let factory: DriverFactory = Arc::new(move |_path: PathBuf| {
      let driver = driver_for_factory.clone();
      Box::pin(async move { Ok(driver as Arc<dyn AutomationDriver>) })
    });
    let registry = Arc::new(ExternalSessionRegistry::new(store, factory));

    Fixture {
      orchestrator: OrderingOrchestrator::new(registry, auth, Arc::new(PassthroughNormalizer)),
      access_token: pair.unwrap().access_token,
      driver,
      _dir: dir,
    }
  }

  fn request(fx: &Fixture, items: Vec<GroceryItem>) -> OrderingRequest {
    OrderingRequest {
      username: "alice".to_string(),
      access_token: fx.access_token.clone(),
      items,
      ranking: RankingContext::default(),
      checkout: None,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn happy_path_adds_and_verifies() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_product("milk", "Amul Milk 1l", 52.0)
        .with_product("bread", "Brown Bread", 40.0),
    );
    let fx = fixture(driver.clone()).await;

    let report = fx
      .orchestrator
      .run(
        request(
          &fx,
          vec![
            GroceryItem::new("milk", 1.0, "l"),
            GroceryItem::new("bread", 1.0, "pack"),
          ],
        ),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await?;

    assert_eq!(report.added.len(), 2);
    assert!(report.failed.is_empty());
    assert!(report.cart_verified);
    assert!(report.checkout.is_none());
    assert_eq!(driver.cart_len(), 2);
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn falls_back_to_next_variant_when_add_fails() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_products(
          "milk",
          vec![("Milk 1l Premium", 80.0), ("Milk 1l", 40.0)],
        )
        .failing_add("p-milk-1"), // the cheaper, top-ranked one fails
    );
    let fx = fixture(driver.clone()).await;

    let report = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await?;

    assert_eq!(report.added.len(), 1);
    assert_eq!(report.added[0].product_name, "Milk 1l Premium");
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn dissimilar_results_fail_the_item_not_the_run() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_product("milk", "Amul Milk 1l", 52.0)
        .with_product("saffron", "Garden Hose 20m", 500.0),
    );
    let fx = fixture(driver.clone()).await;

    let report = fx
      .orchestrator
      .run(
        request(
          &fx,
          vec![
            GroceryItem::new("milk", 1.0, "l"),
            GroceryItem::new("saffron", 1.0, "g"),
          ],
        ),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await?;

    assert_eq!(report.added.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].requested, "saffron");
    assert_eq!(report.failed[0].kind, FailureKind::NoSimilarMatch);
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn nothing_similar_at_all_is_product_verification_failure() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x")).with_product("saffron", "Garden Hose 20m", 500.0),
    );
    let fx = fixture(driver.clone()).await;

    let err = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("saffron", 1.0, "g")]),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await;

    assert!(matches!(err, Err(AppError::ProductVerificationFailed(_))));
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn dead_page_reinitializes_once() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_product("milk", "Amul Milk 1l", 52.0)
        .with_dead_page_until_reinit(),
    );
    let fx = fixture(driver.clone()).await;

    let report = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await?;

    assert_eq!(driver.reinit_count(), 1);
    assert_eq!(report.added.len(), 1);
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn unrebuildable_page_is_service_unavailable() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_product("milk", "Amul Milk 1l", 52.0)
        .with_permanently_dead_page(),
    );
    let fx = fixture(driver.clone()).await;

    let err = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await;

    assert!(matches!(err, Err(AppError::ServiceUnavailable(_))));
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn empty_cart_fails_verification_loudly() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_product("milk", "Amul Milk 1l", 52.0)
        .with_phantom_cart(), // adds "succeed" but the cart stays empty
    );
    let fx = fixture(driver.clone()).await;

    let err = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await;

    assert!(matches!(err, Err(AppError::CartVerificationFailed(_))));
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn revoked_session_cannot_order() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x")).with_product("milk", "Amul Milk 1l", 52.0),
    );
    let fx = fixture(driver.clone()).await;

    fx.orchestrator
      .auth
      .revoke_token(&fx.access_token, &RequestContext::default())
      .await?;

    let err = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]),
        &RequestContext::default(),
        &CancellationToken::new(),
      )
      .await;

    assert!(matches!(err, Err(AppError::Core(CoreError::SessionRevoked))));
    assert_eq!(driver.cart_len(), 0);
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn store_closed_surfaces_cleanly_at_checkout() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x"))
        .with_product("milk", "Amul Milk 1l", 52.0)
        .with_store_closed(),
    );
    let fx = fixture(driver.clone()).await;

    let mut req = request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]);
    req.checkout = Some(CheckoutSelection {
      address_index: 0,
      payment_index: 0,
    });

    let err = fx
      .orchestrator
      .run(req, &RequestContext::default(), &CancellationToken::new())
      .await;

    assert!(matches!(err, Err(AppError::StoreClosed(_))));
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_stops_between_stages() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x")).with_product("milk", "Amul Milk 1l", 52.0),
    );
    let fx = fixture(driver.clone()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx
      .orchestrator
      .run(
        request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]),
        &RequestContext::default(),
        &cancel,
      )
      .await;

    assert!(matches!(err, Err(AppError::Timeout(_))));
    assert_eq!(driver.cart_len(), 0);
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn checkout_submits_with_selected_options() -> anyhow::Result<()> {
    let driver = Arc::new(
      MockDriver::healthy(PathBuf::from("/tmp/x")).with_product("milk", "Amul Milk 1l", 52.0),
    );
    let fx = fixture(driver.clone()).await;

    let mut req = request(&fx, vec![GroceryItem::new("milk", 1.0, "l")]);
    req.checkout = Some(CheckoutSelection {
      address_index: 0,
      payment_index: 0,
    });

    let report = fx
      .orchestrator
      .run(req, &RequestContext::default(), &CancellationToken::new())
      .await?;

    let checkout = report.checkout.expect("checkout performed");
    assert_eq!(checkout.address.label, "Home");
    assert_eq!(driver.submitted_orders(), 1);
    Ok(())
  }
}
