use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::ValidateEmail;

use pantrykit_core::contracts::{
  AuditRepository, NewUser, RequestContext, SessionRepository, UserRepository,
};
use pantrykit_core::error::{AuthFailureReason, CoreError};
use pantrykit_core::models::{
  normalize_email, AuditEvent, AuditEventType, AuthResult, User,
};
use pantrykit_core::token::{TokenKind, TokenService};

use crate::domains::user::password::{hashed_password, validate_password, verify_password};

use super::{CredentialProvider, Credentials};

pub const PROVIDER_NAME: &str = "password";

/// Email + password authentication with account lockout and reset tokens.
pub struct PasswordProvider {
  users: Arc<dyn UserRepository>,
  sessions: Arc<dyn SessionRepository>,
  audit: Arc<dyn AuditRepository>,
  token_service: Arc<TokenService>,
  hash_cost: u32,
  max_login_attempts: i32,
  lockout_duration: Duration,
  require_email_verification: bool,
}

impl PasswordProvider {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionRepository>,
    audit: Arc<dyn AuditRepository>,
    token_service: Arc<TokenService>,
    hash_cost: u32,
    max_login_attempts: i32,
    lockout_duration_secs: i64,
    require_email_verification: bool,
  ) -> Self {
    Self {
      users,
      sessions,
      audit,
      token_service,
      hash_cost,
      max_login_attempts,
      lockout_duration: Duration::seconds(lockout_duration_secs),
      require_email_verification,
    }
  }

  /// Issue a reset token and store its value + expiry on the user row. The
  /// returned token goes out via a channel outside the core (email).
  #[instrument(skip(self))]
  pub async fn request_password_reset(
    &self,
    email: &str,
    ctx: &RequestContext,
  ) -> Result<Option<String>, CoreError> {
    let email = normalize_email(email);
    let Some(user) = self.users.find_by_email(&email).await? else {
      // No user enumeration: same outward shape as success.
      return Ok(None);
    };

    let (token, claims) = self.token_service.issue_reset(user.id, &user.email)?;
    self
      .users
      .set_reset_token(user.id, &token, claims.expires_at())
      .await?;

    self
      .audit
      .append(
        AuditEvent::new(AuditEventType::PasswordResetRequested, true)
          .user(user.id)
          .email(user.email.clone())
          .provider(PROVIDER_NAME)
          .ip_address(ctx.ip_address.clone()),
      )
      .await?;

    Ok(Some(token))
  }

  /// Complete a reset: the token must validate, match the stored value, and
  /// be unexpired. All existing sessions for the user are revoked.
  #[instrument(skip(self, token, new_password))]
  pub async fn complete_password_reset(
    &self,
    token: &str,
    new_password: &str,
    ctx: &RequestContext,
  ) -> Result<User, CoreError> {
    let claims = self.token_service.validate(token, TokenKind::Reset)?;
    let user_id = claims.user_id()?;

    let user = self
      .users
      .find_by_id(user_id)
      .await?
      .ok_or_else(|| CoreError::UserNotFound(claims.email.clone()))?;

    let stored_matches = user.password_reset_token.as_deref() == Some(token);
    let unexpired = matches!(user.password_reset_expires, Some(exp) if exp > Utc::now());
    if !stored_matches || !unexpired {
      return Err(CoreError::AuthFailed(AuthFailureReason::InvalidResetToken));
    }

    validate_password(new_password, &user.email)?;
    let hash = hashed_password(new_password, self.hash_cost)?;
    self.users.set_password_hash(user.id, &hash).await?;

    let revoked = self.sessions.revoke_all_for_user(user.id).await?;
    info!(user_id = %user.id, revoked, "password reset revoked sessions");

    self
      .audit
      .append(
        AuditEvent::new(AuditEventType::PasswordResetCompleted, true)
          .user(user.id)
          .email(user.email.clone())
          .provider(PROVIDER_NAME)
          .ip_address(ctx.ip_address.clone()),
      )
      .await?;

    Ok(user)
  }

  async fn audit_login_failure(
    &self,
    email: &str,
    user: Option<&User>,
    reason: &str,
    ctx: &RequestContext,
  ) -> Result<(), CoreError> {
    let mut event = AuditEvent::new(AuditEventType::LoginFailed, false)
      .email(email)
      .provider(PROVIDER_NAME)
      .ip_address(ctx.ip_address.clone())
      .failure_reason(reason);
    if let Some(user) = user {
      event = event.user(user.id);
    }
    self.audit.append(event).await
  }
}

#[async_trait]
impl CredentialProvider for PasswordProvider {
  fn name(&self) -> &str {
    PROVIDER_NAME
  }

  #[instrument(skip(self, credentials, profile))]
  async fn register(
    &self,
    credentials: &Credentials,
    profile: serde_json::Value,
    _ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError> {
    let Credentials::Password { email, password } = credentials else {
      return Err(CoreError::Validation(
        "password registration requires email and password".to_string(),
      ));
    };

    let email = normalize_email(email);
    if !email.validate_email() {
      return Err(CoreError::Validation(format!(
        "invalid email address: {}",
        email
      )));
    }

    validate_password(password, &email)?;

    if self.users.exists_by_email(&email).await? {
      return Err(CoreError::UserAlreadyExists(email));
    }

    let password_hash = hashed_password(password, self.hash_cost)?;

    // The user row and its registration audit record commit together.
    let user = self
      .users
      .insert(NewUser {
        email: email.clone(),
        email_verified: false,
        auth_provider: PROVIDER_NAME.to_string(),
        password_hash: Some(password_hash),
        profile,
        oauth_accounts: vec![],
      })
      .await?;

    info!(user_id = %user.id, "user registered");

    if self.require_email_verification && !user.email_verified {
      return Ok(AuthResult::RequiresVerification);
    }

    Ok(AuthResult::Success {
      user_id: user.id,
      email: user.email,
      metadata: None,
    })
  }

  #[instrument(skip(self, credentials))]
  async fn authenticate(
    &self,
    credentials: &Credentials,
    ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError> {
    let Credentials::Password { email, password } = credentials else {
      return Err(CoreError::Validation(
        "password authentication requires email and password".to_string(),
      ));
    };

    let email = normalize_email(email);
    let Some(user) = self.users.find_by_email(&email).await? else {
      self
        .audit_login_failure(&email, None, "unknown email", ctx)
        .await?;
      return Ok(AuthResult::Failure {
        reason: AuthFailureReason::InvalidCredentials,
      });
    };

    if user.is_locked(Utc::now()) {
      self
        .audit_login_failure(&email, Some(&user), "account locked", ctx)
        .await?;
      return Ok(AuthResult::Failure {
        reason: AuthFailureReason::AccountLocked,
      });
    }

    let Some(stored_hash) = user.password_hash.as_deref() else {
      // OAuth-only account; a password can never match.
      self
        .audit_login_failure(&email, Some(&user), "no password on account", ctx)
        .await?;
      return Ok(AuthResult::Failure {
        reason: AuthFailureReason::InvalidCredentials,
      });
    };

    if !verify_password(password, stored_hash)? {
      let attempts = self
        .users
        .record_failed_login(user.id, self.max_login_attempts, self.lockout_duration)
        .await?;
      if attempts >= self.max_login_attempts {
        warn!(user_id = %user.id, attempts, "account locked after repeated failures");
      }
      self
        .audit_login_failure(&email, Some(&user), "password mismatch", ctx)
        .await?;
      return Ok(AuthResult::Failure {
        reason: AuthFailureReason::InvalidCredentials,
      });
    }

    if self.require_email_verification && !user.email_verified {
      self
        .audit_login_failure(&email, Some(&user), "email not verified", ctx)
        .await?;
      return Ok(AuthResult::Failure {
        reason: AuthFailureReason::EmailNotVerified,
      });
    }

    self.users.record_successful_login(user.id).await?;

    self
      .audit
      .append(
        AuditEvent::new(AuditEventType::LoginSuccess, true)
          .user(user.id)
          .email(user.email.clone())
          .provider(PROVIDER_NAME)
          .ip_address(ctx.ip_address.clone()),
      )
      .await?;

    Ok(AuthResult::Success {
      user_id: user.id,
      email: user.email,
      metadata: None,
    })
  }

  fn supports_password_reset(&self) -> bool {
    true
  }

  fn supports_email_verification(&self) -> bool {
    true
  }
}
