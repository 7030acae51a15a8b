use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use pantrykit_core::contracts::{NewSession, SessionRepository};
use pantrykit_core::error::CoreError;
use pantrykit_core::models::{AuditEventType, Session, SessionId, UserId};

use crate::database::TransactionRuntime;

const SESSION_COLUMNS: &str = "id, user_id, access_token_jti, refresh_token_jti, device_info, \
   created_at, expires_at, last_activity, revoked";

pub struct SessionRepositoryImpl {
  pool: PgPool,
  runtime: TransactionRuntime,
}

impl SessionRepositoryImpl {
  pub fn new(pool: PgPool) -> Self {
    let runtime = TransactionRuntime::new(pool.clone());
    Self { pool, runtime }
  }
}

#[async_trait]
impl SessionRepository for SessionRepositoryImpl {
  /// The session row and the `tokens_issued` audit record commit together;
  /// a token pair is only handed out once this returns.
  async fn create(&self, session: NewSession) -> Result<Session, CoreError> {
    let created = self
      .runtime
      .execute_in_transaction(|tx| {
        let session = session.clone();
        Box::pin(async move {
          let row: Session = tx
            .fetch_one(
              "sessions",
              sqlx::query_as::<_, Session>(&format!(
                "INSERT INTO sessions (user_id, access_token_jti, refresh_token_jti, \
                 device_info, expires_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING {}",
                SESSION_COLUMNS
              ))
              .bind(session.user_id)
              .bind(session.access_token_jti)
              .bind(session.refresh_token_jti)
              .bind(session.device_info)
              .bind(session.expires_at),
            )
            .await?;

          tx.execute(
            "insert_one",
            "audit_log",
            sqlx::query(
              "INSERT INTO audit_log (event_type, user_id, ip_address, success, metadata) \
               VALUES ($1, $2, $3, TRUE, $4)",
            )
            .bind(AuditEventType::TokensIssued.as_str())
            .bind(row.user_id)
            .bind(session.ip_address)
            .bind(serde_json::json!({ "session_id": row.id })),
          )
          .await?;

          Ok(row)
        })
      })
      .await
      .map_err(|e| e.into_core())?;

    Ok(created)
  }

  async fn find_by_access_jti(&self, jti: &str) -> Result<Option<Session>, CoreError> {
    let session = sqlx::query_as::<_, Session>(&format!(
      "SELECT {} FROM sessions \
       WHERE access_token_jti = $1 AND revoked = FALSE AND expires_at > NOW()",
      SESSION_COLUMNS
    ))
    .bind(jti)
    .fetch_optional(&self.pool)
    .await?;

    Ok(session)
  }

  async fn find_by_refresh_jti(&self, jti: &str) -> Result<Option<Session>, CoreError> {
    let session = sqlx::query_as::<_, Session>(&format!(
      "SELECT {} FROM sessions \
       WHERE refresh_token_jti = $1 AND revoked = FALSE AND expires_at > NOW()",
      SESSION_COLUMNS
    ))
    .bind(jti)
    .fetch_optional(&self.pool)
    .await?;

    Ok(session)
  }

  /// Both JTIs swap in one UPDATE; a concurrent revocation between read and
  /// rotate loses, because the filter re-checks `revoked`.
  async fn rotate(
    &self,
    id: SessionId,
    new_access_jti: &str,
    new_refresh_jti: &str,
    new_expires_at: DateTime<Utc>,
  ) -> Result<Session, CoreError> {
    let rotated = sqlx::query_as::<_, Session>(&format!(
      "UPDATE sessions SET access_token_jti = $2, refresh_token_jti = $3, \
       expires_at = $4, last_activity = NOW() \
       WHERE id = $1 AND revoked = FALSE RETURNING {}",
      SESSION_COLUMNS
    ))
    .bind(id)
    .bind(new_access_jti)
    .bind(new_refresh_jti)
    .bind(new_expires_at)
    .fetch_optional(&self.pool)
    .await?;

    rotated.ok_or(CoreError::SessionRevoked)
  }

  async fn touch_activity(&self, id: SessionId) -> Result<(), CoreError> {
    sqlx::query("UPDATE sessions SET last_activity = NOW() WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;

    Ok(())
  }

  async fn revoke_by_jti(&self, jti: &str) -> Result<u64, CoreError> {
    let result = sqlx::query(
      "UPDATE sessions SET revoked = TRUE \
       WHERE (access_token_jti = $1 OR refresh_token_jti = $1) AND revoked = FALSE",
    )
    .bind(jti)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }

  async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64, CoreError> {
    let result =
      sqlx::query("UPDATE sessions SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE")
        .bind(user_id)
        .execute(&self.pool)
        .await?;

    Ok(result.rows_affected())
  }

  async fn delete_expired(&self) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected())
  }
}
