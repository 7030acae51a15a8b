//! Scriptable automation driver for registry and pipeline tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::AppError;

use super::driver::{AutomationDriver, ProductCandidate, SavedOption};

pub struct MockDriver {
  #[allow(dead_code)]
  auth_path: PathBuf,
  page_live: AtomicBool,
  reinit_works: bool,
  reinit_count: AtomicUsize,
  logged_in: bool,
  catalog: HashMap<String, Vec<ProductCandidate>>,
  failing_adds: HashSet<String>,
  phantom_cart: bool,
  store_closed: bool,
  cart: Mutex<Vec<String>>,
  close_count: AtomicUsize,
  submitted: AtomicUsize,
}

impl MockDriver {
  pub fn healthy(auth_path: PathBuf) -> Self {
    Self {
      auth_path,
      page_live: AtomicBool::new(true),
      reinit_works: true,
      reinit_count: AtomicUsize::new(0),
      logged_in: true,
      catalog: HashMap::new(),
      failing_adds: HashSet::new(),
      phantom_cart: false,
      store_closed: false,
      cart: Mutex::new(Vec::new()),
      close_count: AtomicUsize::new(0),
      submitted: AtomicUsize::new(0),
    }
  }

  pub fn with_product(self, query: &str, name: &str, price: f64) -> Self {
    self.with_products(query, vec![(name, price)])
  }

  pub fn with_products(mut self, query: &str, products: Vec<(&str, f64)>) -> Self {
    let candidates = products
      .into_iter()
      .enumerate()
      .map(|(position, (name, price))| ProductCandidate {
        product_id: format!("p-{}-{}", query, position),
        name: name.to_string(),
        price,
        pack_size: None,
        pack_unit: None,
        has_offer: false,
        available: true,
        position,
      })
      .collect();
    self.catalog.insert(query.to_string(), candidates);
    self
  }

  pub fn failing_add(mut self, product_id: &str) -> Self {
    self.failing_adds.insert(product_id.to_string());
    self
  }

  pub fn with_dead_page_until_reinit(self) -> Self {
    self.page_live.store(false, Ordering::SeqCst);
    self
  }

  pub fn with_permanently_dead_page(mut self) -> Self {
    self.page_live.store(false, Ordering::SeqCst);
    self.reinit_works = false;
    self
  }

  pub fn with_phantom_cart(mut self) -> Self {
    self.phantom_cart = true;
    self
  }

  pub fn with_store_closed(mut self) -> Self {
    self.store_closed = true;
    self
  }

  pub fn cart_len(&self) -> usize {
    self.cart.lock().unwrap().len()
  }

  pub fn reinit_count(&self) -> usize {
    self.reinit_count.load(Ordering::SeqCst)
  }

  pub fn close_count(&self) -> usize {
    self.close_count.load(Ordering::SeqCst)
  }

  pub fn submitted_orders(&self) -> usize {
    self.submitted.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl AutomationDriver for MockDriver {
  async fn is_page_live(&self) -> bool {
    self.page_live.load(Ordering::SeqCst)
  }

  async fn reinitialize(&self) -> Result<(), AppError> {
    self.reinit_count.fetch_add(1, Ordering::SeqCst);
    if self.reinit_works {
      self.page_live.store(true, Ordering::SeqCst);
      Ok(())
    } else {
      Err(AppError::PageInvalid("browser crashed".to_string()))
    }
  }

  async fn is_logged_in(&self) -> Result<bool, AppError> {
    Ok(self.logged_in)
  }

  async fn search(&self, query: &str) -> Result<Vec<ProductCandidate>, AppError> {
    Ok(self.catalog.get(query).cloned().unwrap_or_default())
  }

  async fn add_to_cart(&self, candidate: &ProductCandidate) -> Result<(), AppError> {
    if self.failing_adds.contains(&candidate.product_id) {
      return Err(AppError::PageInvalid(format!(
        "add button missing for {}",
        candidate.product_id
      )));
    }
    if !self.phantom_cart {
      self.cart.lock().unwrap().push(candidate.name.clone());
    }
    Ok(())
  }

  async fn cart_bill_text(&self) -> Result<Option<String>, AppError> {
    let cart = self.cart.lock().unwrap();
    if cart.is_empty() {
      Ok(None)
    } else {
      Ok(Some(format!("Bill: {} items", cart.len())))
    }
  }

  async fn cart_item_count(&self) -> Result<usize, AppError> {
    Ok(self.cart.lock().unwrap().len())
  }

  async fn cart_badge_count(&self) -> Result<Option<u32>, AppError> {
    Ok(Some(self.cart.lock().unwrap().len() as u32))
  }

  async fn visible_product_names(&self) -> Result<Vec<String>, AppError> {
    Ok(self.cart.lock().unwrap().clone())
  }

  async fn saved_addresses(&self) -> Result<Vec<SavedOption>, AppError> {
    Ok(vec![
      SavedOption {
        id: "addr-1".to_string(),
        label: "Home".to_string(),
      },
      SavedOption {
        id: "addr-2".to_string(),
        label: "Office".to_string(),
      },
    ])
  }

  async fn saved_payment_methods(&self) -> Result<Vec<SavedOption>, AppError> {
    Ok(vec![SavedOption {
      id: "pay-1".to_string(),
      label: "UPI".to_string(),
    }])
  }

  async fn submit_order(&self, _address_id: &str, _payment_id: &str) -> Result<(), AppError> {
    if self.store_closed {
      return Err(AppError::StoreClosed(
        "store is not accepting orders right now".to_string(),
      ));
    }
    self.submitted.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn close(&self) -> Result<(), AppError> {
    self.close_count.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
