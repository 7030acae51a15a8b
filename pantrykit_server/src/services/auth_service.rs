//! Authentication service: providers, token issuance, session lifecycle.
//!
//! Session creation is transactional in the repository: a token pair is only
//! returned once its session row (and the `tokens_issued` audit record) has
//! committed. A pair whose access JTI does not match a live session row is
//! unusable no matter how valid its signature is.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use pantrykit_core::contracts::{
  AuditRepository, NewSession, RequestContext, SessionRepository, UserRepository,
};
use pantrykit_core::error::{AuthFailureReason, CoreError};
use pantrykit_core::models::{
  AuditEvent, AuditEventType, AuthResult, SessionInfo, UserId,
};
use pantrykit_core::token::{TokenKind, TokenPair, TokenService};

use crate::domains::auth::providers::{CredentialProvider, Credentials, PasswordProvider};

/// Fixed-window rate limiter keyed by caller identifier.
struct RateLimiter {
  limits: DashMap<String, (u32, Instant)>,
  max_requests: u32,
  window: Duration,
}

impl RateLimiter {
  fn new(max_requests: u32, window: Duration) -> Self {
    Self {
      limits: DashMap::new(),
      max_requests,
      window,
    }
  }

  fn check(&self, key: &str) -> Result<(), CoreError> {
    let now = Instant::now();
    let mut entry = self.limits.entry(key.to_string()).or_insert((0, now));
    let (count, window_start) = *entry;

    if now.duration_since(window_start) > self.window {
      *entry = (1, now);
      return Ok(());
    }

    if count >= self.max_requests {
      return Err(CoreError::AuthFailed(AuthFailureReason::RateLimited));
    }

    *entry = (count + 1, window_start);
    Ok(())
  }
}

pub struct AuthService {
  providers: HashMap<String, Arc<dyn CredentialProvider>>,
  password_provider: Option<Arc<PasswordProvider>>,
  token_service: Arc<TokenService>,
  users: Arc<dyn UserRepository>,
  sessions: Arc<dyn SessionRepository>,
  audit: Arc<dyn AuditRepository>,
  login_limiter: RateLimiter,
}

impl AuthService {
  pub fn new(
    token_service: Arc<TokenService>,
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionRepository>,
    audit: Arc<dyn AuditRepository>,
    login_rate_per_15_min: u32,
  ) -> Self {
    Self {
      providers: HashMap::new(),
      password_provider: None,
      token_service,
      users,
      sessions,
      audit,
      login_limiter: RateLimiter::new(login_rate_per_15_min, Duration::from_secs(15 * 60)),
    }
  }

  /// Providers are registered at construction time; there is no dynamic
  /// registration after startup.
  pub fn register_provider(&mut self, provider: Arc<dyn CredentialProvider>) {
    self
      .providers
      .insert(provider.name().to_string(), provider);
  }

  pub fn register_password_provider(&mut self, provider: Arc<PasswordProvider>) {
    self.password_provider = Some(provider.clone());
    self.register_provider(provider);
  }

  pub fn password_provider(&self) -> Option<&Arc<PasswordProvider>> {
    self.password_provider.as_ref()
  }

  pub fn provider_names(&self) -> Vec<&str> {
    self.providers.keys().map(|k| k.as_str()).collect()
  }

  fn provider(&self, name: &str) -> Result<&Arc<dyn CredentialProvider>, CoreError> {
    self
      .providers
      .get(name)
      .ok_or_else(|| CoreError::AuthFailed(AuthFailureReason::ProviderDisabled(name.to_string())))
  }

  #[instrument(skip(self, credentials, profile))]
  pub async fn register_user(
    &self,
    provider_name: &str,
    credentials: &Credentials,
    profile: serde_json::Value,
    ctx: &RequestContext,
  ) -> Result<(AuthResult, Option<TokenPair>), CoreError> {
    let provider = self.provider(provider_name)?;
    let result = provider.register(credentials, profile, ctx).await?;

    match &result {
      AuthResult::Success { user_id, email, .. } => {
        let pair = self.create_session(*user_id, email, ctx).await?;
        Ok((result, Some(pair)))
      }
      _ => Ok((result, None)),
    }
  }

  #[instrument(skip(self, credentials))]
  pub async fn authenticate_user(
    &self,
    provider_name: &str,
    credentials: &Credentials,
    ctx: &RequestContext,
  ) -> Result<(AuthResult, Option<TokenPair>), CoreError> {
    if let Some(key) = rate_limit_key(credentials, ctx) {
      if let Err(e) = self.login_limiter.check(&key) {
        warn!(key, "login rate limit exceeded");
        return Err(e);
      }
    }

    let provider = self.provider(provider_name)?;
    let result = provider.authenticate(credentials, ctx).await?;

    match &result {
      AuthResult::Success { user_id, email, .. } => {
        let pair = self.create_session(*user_id, email, ctx).await?;
        Ok((result, Some(pair)))
      }
      _ => Ok((result, None)),
    }
  }

  /// The session row is durable before the pair leaves this function; a
  /// failed write means the tokens are treated as never issued.
  async fn create_session(
    &self,
    user_id: UserId,
    email: &str,
    ctx: &RequestContext,
  ) -> Result<TokenPair, CoreError> {
    let pair = self.token_service.issue_pair(user_id, email)?;

    self
      .sessions
      .create(NewSession {
        user_id,
        access_token_jti: pair.access_jti.clone(),
        refresh_token_jti: pair.refresh_jti.clone(),
        device_info: ctx.device_info.clone(),
        expires_at: pair.refresh_expires_at,
        ip_address: ctx.ip_address.clone(),
      })
      .await?;

    Ok(pair)
  }

  /// Rotate a refresh token: both JTIs swap in one update, so the old pair
  /// stops routing at the same instant the new one starts.
  #[instrument(skip(self, refresh_token))]
  pub async fn refresh_token(
    &self,
    refresh_token: &str,
    ctx: &RequestContext,
  ) -> Result<TokenPair, CoreError> {
    let claims = self
      .token_service
      .validate(refresh_token, TokenKind::Refresh)?;

    let session = self
      .sessions
      .find_by_refresh_jti(&claims.jti)
      .await?
      .ok_or(CoreError::SessionRevoked)?;

    let user = self
      .users
      .find_by_id(session.user_id)
      .await?
      .ok_or_else(|| CoreError::UserNotFound(session.user_id.to_string()))?;

    let pair = self.token_service.issue_pair(user.id, &user.email)?;
    self
      .sessions
      .rotate(
        session.id,
        &pair.access_jti,
        &pair.refresh_jti,
        pair.refresh_expires_at,
      )
      .await?;

    self
      .audit
      .append(
        AuditEvent::new(AuditEventType::TokenRefreshed, true)
          .user(user.id)
          .email(user.email.clone())
          .ip_address(ctx.ip_address.clone()),
      )
      .await?;

    info!(user_id = %user.id, "refresh token rotated");
    Ok(pair)
  }

  /// Access token → live session, or `None`. A revoked or swept session
  /// makes the token unusable regardless of signature validity.
  #[instrument(skip(self, access_token))]
  pub async fn validate_session(
    &self,
    access_token: &str,
  ) -> Result<Option<SessionInfo>, CoreError> {
    let claims = match self.token_service.validate(access_token, TokenKind::Access) {
      Ok(claims) => claims,
      Err(CoreError::TokenInvalid) => return Ok(None),
      Err(e) => return Err(e),
    };

    let Some(session) = self.sessions.find_by_access_jti(&claims.jti).await? else {
      return Ok(None);
    };

    self.sessions.touch_activity(session.id).await?;

    Ok(Some(SessionInfo {
      session_id: session.id,
      user_id: session.user_id,
      email: claims.email,
      expires_at: session.expires_at,
    }))
  }

  /// Decode (unchecked, so revocation works for expired tokens too) and
  /// revoke any session carrying the JTI.
  #[instrument(skip(self, token))]
  pub async fn revoke_token(&self, token: &str, ctx: &RequestContext) -> Result<bool, CoreError> {
    let claims = self.token_service.decode_unchecked(token)?;
    let revoked = self.sessions.revoke_by_jti(&claims.jti).await?;

    self
      .audit
      .append(
        AuditEvent::new(AuditEventType::TokenRevoked, revoked > 0)
          .user(claims.user_id().unwrap_or(UserId(0)))
          .email(claims.email.clone())
          .ip_address(ctx.ip_address.clone()),
      )
      .await?;

    Ok(revoked > 0)
  }

  pub async fn logout(&self, access_token: &str, ctx: &RequestContext) -> Result<(), CoreError> {
    let _ = self.revoke_token(access_token, ctx).await?;
    Ok(())
  }

  pub async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64, CoreError> {
    self.sessions.revoke_all_for_user(user_id).await
  }
}

fn rate_limit_key(credentials: &Credentials, ctx: &RequestContext) -> Option<String> {
  match credentials {
    Credentials::Password { email, .. } => Some(format!(
      "login:{}:{}",
      email.to_lowercase(),
      ctx.ip_address.as_deref().unwrap_or("-")
    )),
    Credentials::OAuthCallback { .. } => None,
  }
}
