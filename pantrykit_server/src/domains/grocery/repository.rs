use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;

use pantrykit_core::contracts::GroceryListRepository;
use pantrykit_core::error::CoreError;
use pantrykit_core::models::{GroceryItem, GroceryList, ListId, UserId};

use crate::database::TransactionRuntime;

const LIST_COLUMNS: &str = "id, user_id, name, items, version, created_at, updated_at";

pub struct GroceryListRepositoryImpl {
  pool: PgPool,
  runtime: TransactionRuntime,
}

impl GroceryListRepositoryImpl {
  pub fn new(pool: PgPool) -> Self {
    let runtime = TransactionRuntime::new(pool.clone());
    Self { pool, runtime }
  }
}

#[async_trait]
impl GroceryListRepository for GroceryListRepositoryImpl {
  async fn create(
    &self,
    user_id: UserId,
    name: &str,
    items: Vec<GroceryItem>,
  ) -> Result<GroceryList, CoreError> {
    let list = sqlx::query_as::<_, GroceryList>(&format!(
      "INSERT INTO grocery_lists (user_id, name, items) VALUES ($1, $2, $3) RETURNING {}",
      LIST_COLUMNS
    ))
    .bind(user_id)
    .bind(name)
    .bind(Json(items))
    .fetch_one(&self.pool)
    .await?;

    Ok(list)
  }

  async fn find(&self, user_id: UserId, name: &str) -> Result<Option<GroceryList>, CoreError> {
    let list = sqlx::query_as::<_, GroceryList>(&format!(
      "SELECT {} FROM grocery_lists WHERE user_id = $1 AND name = $2",
      LIST_COLUMNS
    ))
    .bind(user_id)
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;

    Ok(list)
  }

  async fn list_for_user(&self, user_id: UserId) -> Result<Vec<GroceryList>, CoreError> {
    let lists = sqlx::query_as::<_, GroceryList>(&format!(
      "SELECT {} FROM grocery_lists WHERE user_id = $1 ORDER BY name",
      LIST_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(lists)
  }

  /// Optimistic update: the filter includes the version the caller read.
  /// Zero matched rows on an existing list means another writer got there
  /// first, which is a `VersionConflict`, not a silent no-op.
  async fn update_items(
    &self,
    id: ListId,
    items: Vec<GroceryItem>,
    expected_version: i32,
  ) -> Result<GroceryList, CoreError> {
    let updated = self
      .runtime
      .execute_in_transaction(|tx| {
        let items = items.clone();
        Box::pin(async move {
          let updated: Option<GroceryList> = tx
            .fetch_optional(
              "grocery_lists",
              sqlx::query_as::<_, GroceryList>(&format!(
                "UPDATE grocery_lists SET items = $2, version = version + 1, \
                 updated_at = NOW() WHERE id = $1 AND version = $3 RETURNING {}",
                LIST_COLUMNS
              ))
              .bind(id)
              .bind(Json(items))
              .bind(expected_version),
            )
            .await?;

          if let Some(list) = updated {
            return Ok(list);
          }

          let existing: Option<GroceryList> = tx
            .fetch_optional(
              "grocery_lists",
              sqlx::query_as::<_, GroceryList>(&format!(
                "SELECT {} FROM grocery_lists WHERE id = $1",
                LIST_COLUMNS
              ))
              .bind(id),
            )
            .await?;

          match existing {
            Some(list) => Err(
              CoreError::VersionConflict {
                entity: format!("grocery_list:{}", list.name),
                expected: expected_version,
              }
              .into(),
            ),
            None => Err(CoreError::NotFound(format!("grocery list {}", id)).into()),
          }
        })
      })
      .await
      .map_err(|e| e.into_core())?;

    Ok(updated)
  }

  async fn delete(&self, id: ListId) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM grocery_lists WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected() > 0)
  }
}
