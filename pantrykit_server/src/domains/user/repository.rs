use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use pantrykit_core::contracts::{NewUser, UserRepository};
use pantrykit_core::error::CoreError;
use pantrykit_core::models::{AuditEventType, OAuthAccount, User, UserId};

use crate::database::TransactionRuntime;

const USER_COLUMNS: &str = "id, email, email_verified, auth_provider, password_hash, \
   oauth_accounts, profile, failed_login_attempts, locked_until, last_login, \
   last_password_change, password_reset_token, password_reset_expires, is_onboarded, \
   created_at, updated_at";

/// User row data access. Registration writes the user row and its
/// `user_registered` audit record in a single transaction.
pub struct UserRepositoryImpl {
  pool: PgPool,
  runtime: TransactionRuntime,
}

impl UserRepositoryImpl {
  pub fn new(pool: PgPool) -> Self {
    let runtime = TransactionRuntime::new(pool.clone());
    Self { pool, runtime }
  }
}

#[async_trait]
impl UserRepository for UserRepositoryImpl {
  async fn insert(&self, user: NewUser) -> Result<User, CoreError> {
    let created = self
      .runtime
      .execute_in_transaction(|session| {
        let user = user.clone();
        Box::pin(async move {
          let oauth_accounts = serde_json::to_value(&user.oauth_accounts)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

          let row: User = session
            .fetch_one(
              "users",
              sqlx::query_as::<_, User>(&format!(
                "INSERT INTO users (email, email_verified, auth_provider, password_hash, \
                 oauth_accounts, profile) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
                USER_COLUMNS
              ))
              .bind(user.email)
              .bind(user.email_verified)
              .bind(user.auth_provider.clone())
              .bind(user.password_hash)
              .bind(oauth_accounts)
              .bind(user.profile),
            )
            .await?;

          session
            .execute(
              "insert_one",
              "audit_log",
              sqlx::query(
                "INSERT INTO audit_log (event_type, user_id, email, provider, success) \
                 VALUES ($1, $2, $3, $4, TRUE)",
              )
              .bind(AuditEventType::UserRegistered.as_str())
              .bind(row.id)
              .bind(row.email.clone())
              .bind(user.auth_provider),
            )
            .await?;

          Ok(row)
        })
      })
      .await
      .map_err(|e| e.into_core())?;

    Ok(created)
  }

  async fn find_by_id(&self, id: UserId) -> Result<Option<User>, CoreError> {
    let user = sqlx::query_as::<_, User>(&format!(
      "SELECT {} FROM users WHERE id = $1",
      USER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(user)
  }

  async fn find_by_email(&self, email: &str) -> Result<Option<User>, CoreError> {
    let user = sqlx::query_as::<_, User>(&format!(
      "SELECT {} FROM users WHERE email = $1",
      USER_COLUMNS
    ))
    .bind(email)
    .fetch_optional(&self.pool)
    .await?;

    Ok(user)
  }

  async fn exists_by_email(&self, email: &str) -> Result<bool, CoreError> {
    let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM users WHERE email = $1")
      .bind(email)
      .fetch_optional(&self.pool)
      .await?;

    Ok(exists.is_some())
  }

  async fn record_failed_login(
    &self,
    id: UserId,
    threshold: i32,
    lockout: Duration,
  ) -> Result<i32, CoreError> {
    let locked_until = Utc::now() + lockout;

    let attempts: i32 = sqlx::query_scalar(
      "UPDATE users SET \
         failed_login_attempts = failed_login_attempts + 1, \
         locked_until = CASE WHEN failed_login_attempts + 1 >= $2 THEN $3 ELSE locked_until END, \
         updated_at = NOW() \
       WHERE id = $1 RETURNING failed_login_attempts",
    )
    .bind(id)
    .bind(threshold)
    .bind(locked_until)
    .fetch_one(&self.pool)
    .await?;

    Ok(attempts)
  }

  async fn record_successful_login(&self, id: UserId) -> Result<(), CoreError> {
    sqlx::query(
      "UPDATE users SET failed_login_attempts = 0, locked_until = NULL, \
       last_login = NOW(), updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn set_password_hash(&self, id: UserId, password_hash: &str) -> Result<(), CoreError> {
    sqlx::query(
      "UPDATE users SET password_hash = $2, last_password_change = NOW(), \
       password_reset_token = NULL, password_reset_expires = NULL, updated_at = NOW() \
       WHERE id = $1",
    )
    .bind(id)
    .bind(password_hash)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn set_reset_token(
    &self,
    id: UserId,
    token: &str,
    expires_at: DateTime<Utc>,
  ) -> Result<(), CoreError> {
    sqlx::query(
      "UPDATE users SET password_reset_token = $2, password_reset_expires = $3, \
       updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(token)
    .bind(expires_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn clear_reset_token(&self, id: UserId) -> Result<(), CoreError> {
    sqlx::query(
      "UPDATE users SET password_reset_token = NULL, password_reset_expires = NULL, \
       updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn link_oauth_account(&self, id: UserId, account: OAuthAccount) -> Result<(), CoreError> {
    let account_json =
      serde_json::to_value(&account).map_err(|e| CoreError::Internal(e.to_string()))?;

    sqlx::query(
      "UPDATE users SET oauth_accounts = oauth_accounts || $2::jsonb, updated_at = NOW() \
       WHERE id = $1",
    )
    .bind(id)
    .bind(account_json)
    .execute(&self.pool)
    .await?;

    Ok(())
  }
}
