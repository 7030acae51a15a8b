//! The seam to the third-party browser-automation library.
//!
//! The orchestrator and the session registry only ever see this trait; the
//! concrete driver binds to a per-user on-disk auth state and is never shared
//! across usernames.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One product returned by a storefront search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCandidate {
  pub product_id: String,
  pub name: String,
  pub price: f64,
  pub pack_size: Option<f64>,
  pub pack_unit: Option<String>,
  pub has_offer: bool,
  pub available: bool,
  /// Zero-based position in the search results.
  pub position: usize,
}

/// Saved address / payment method as shown at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedOption {
  pub id: String,
  pub label: String,
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
  /// Whether the underlying page handle still responds.
  async fn is_page_live(&self) -> bool;

  /// Tear down and rebuild the page once; callers give up after one attempt.
  async fn reinitialize(&self) -> Result<(), AppError>;

  /// Whether the persisted auth state still logs into the storefront.
  async fn is_logged_in(&self) -> Result<bool, AppError>;

  async fn search(&self, query: &str) -> Result<Vec<ProductCandidate>, AppError>;

  async fn add_to_cart(&self, candidate: &ProductCandidate) -> Result<(), AppError>;

  // Cart-verification probes; each is an independent strategy.
  async fn cart_bill_text(&self) -> Result<Option<String>, AppError>;
  async fn cart_item_count(&self) -> Result<usize, AppError>;
  async fn cart_badge_count(&self) -> Result<Option<u32>, AppError>;
  async fn visible_product_names(&self) -> Result<Vec<String>, AppError>;

  // Checkout.
  async fn saved_addresses(&self) -> Result<Vec<SavedOption>, AppError>;
  async fn saved_payment_methods(&self) -> Result<Vec<SavedOption>, AppError>;
  async fn submit_order(&self, address_id: &str, payment_id: &str) -> Result<(), AppError>;

  /// Close the browser session; must be safe to call more than once.
  async fn close(&self) -> Result<(), AppError>;
}
