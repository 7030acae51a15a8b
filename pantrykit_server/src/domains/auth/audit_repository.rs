use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use pantrykit_core::contracts::AuditRepository;
use pantrykit_core::error::CoreError;
use pantrykit_core::models::AuditEvent;

/// Append-only audit storage. There is deliberately no update path.
pub struct AuditRepositoryImpl {
  pool: PgPool,
}

impl AuditRepositoryImpl {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl AuditRepository for AuditRepositoryImpl {
  async fn append(&self, event: AuditEvent) -> Result<(), CoreError> {
    sqlx::query(
      "INSERT INTO audit_log \
       (event_type, user_id, email, provider, ip_address, success, failure_reason, metadata) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(event.event_type.as_str())
    .bind(event.user_id)
    .bind(event.email)
    .bind(event.provider)
    .bind(event.ip_address)
    .bind(event.success)
    .bind(event.failure_reason)
    .bind(event.metadata)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM audit_log WHERE timestamp < $1")
      .bind(cutoff)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected())
  }
}
