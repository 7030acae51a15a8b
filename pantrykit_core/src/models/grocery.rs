use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use super::ids::{ListId, UserId};

/// One entry on a grocery list, already normalized to canonical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroceryItem {
  pub item_name: String,
  pub quantity: f64,
  pub unit: String,
}

impl GroceryItem {
  pub fn new(item_name: impl Into<String>, quantity: f64, unit: impl Into<String>) -> Self {
    Self {
      item_name: item_name.into(),
      quantity,
      unit: unit.into(),
    }
  }
}

/// A versioned grocery list. `version` is monotone: every committed mutation
/// increments it by exactly one, and writers must present the version they
/// read (optimistic locking).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroceryList {
  pub id: ListId,
  pub user_id: UserId,
  pub name: String,
  pub items: Json<Vec<GroceryItem>>,
  pub version: i32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Deduplicate items by lowercase name + unit, summing quantities.
pub fn dedupe_items(items: Vec<GroceryItem>) -> Vec<GroceryItem> {
  let mut out: Vec<GroceryItem> = Vec::with_capacity(items.len());
  for item in items {
    let key = (item.item_name.to_lowercase(), item.unit.to_lowercase());
    match out
      .iter_mut()
      .find(|i| (i.item_name.to_lowercase(), i.unit.to_lowercase()) == key)
    {
      Some(existing) => existing.quantity += item.quantity,
      None => out.push(item),
    }
  }
  out
}
