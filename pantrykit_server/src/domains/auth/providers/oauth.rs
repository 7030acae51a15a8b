use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use pantrykit_core::contracts::{AuditRepository, NewUser, RequestContext, UserRepository};
use pantrykit_core::error::{AuthFailureReason, CoreError};
use pantrykit_core::models::{
  normalize_email, AuditEvent, AuditEventType, AuthResult, OAuthAccount, User,
};
use pantrykit_core::pkce::PkceSession;

use crate::config::OAuthConfig;

use super::{CredentialProvider, Credentials};

const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
  pub access_token: String,
  #[serde(default)]
  pub expires_in: Option<u64>,
  #[serde(default)]
  pub refresh_token: Option<String>,
  pub id_token: String,
}

/// Verified ID-token claims we rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
  pub iss: String,
  pub aud: String,
  pub sub: String,
  pub email: String,
  #[serde(default)]
  pub email_verified: bool,
  pub exp: i64,
  pub iat: i64,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub picture: Option<String>,
}

/// What provisioning needs to know about the external identity.
#[derive(Debug, Clone)]
pub struct OAuthUserInfo {
  pub provider_user_id: String,
  pub email: String,
  pub email_verified: bool,
  pub profile_blob: serde_json::Value,
}

/// Authorization-code + PKCE provider. ID-token signatures are verified
/// against the IdP's JWKS; an unverifiable token never authenticates.
pub struct OAuthProvider {
  name: String,
  config: OAuthConfig,
  http: reqwest::Client,
  users: Arc<dyn UserRepository>,
  audit: Arc<dyn AuditRepository>,
  pending: DashMap<String, PkceSession>,
  jwks_cache: RwLock<Option<(Instant, JwkSet)>>,
}

impl OAuthProvider {
  pub fn new(
    name: impl Into<String>,
    config: OAuthConfig,
    users: Arc<dyn UserRepository>,
    audit: Arc<dyn AuditRepository>,
  ) -> Self {
    Self {
      name: name.into(),
      config,
      http: reqwest::Client::new(),
      users,
      audit,
      pending: DashMap::new(),
      jwks_cache: RwLock::new(None),
    }
  }

  fn redirect_uri(&self) -> String {
    format!("http://localhost:{}/", self.config.redirect_port)
  }

  /// Begin a flow: a fresh PKCE session is kept pending under its state and
  /// the authorization URL is returned for the browser.
  pub fn start_authorization(&self) -> (String, String) {
    let session = PkceSession::new();
    let state = session.state.clone();
    let url = self.authorization_url(&session);
    self.pending.insert(state.clone(), session);
    (url, state)
  }

  pub fn authorization_url(&self, session: &PkceSession) -> String {
    format!(
      "{auth_url}?client_id={client_id}\
       &response_type=code\
       &redirect_uri={redirect_uri}\
       &scope={scope}\
       &code_challenge={code_challenge}\
       &code_challenge_method={method}\
       &state={state}\
       &access_type=offline",
      auth_url = self.config.auth_url,
      client_id = urlencode(&self.config.client_id),
      redirect_uri = urlencode(&self.redirect_uri()),
      scope = urlencode(&self.config.scope),
      code_challenge = urlencode(&session.code_challenge),
      method = session.challenge_method,
      state = urlencode(&session.state),
    )
  }

  /// Exchange an authorization code, presenting the PKCE verifier.
  pub async fn exchange_code(
    &self,
    code: &str,
    code_verifier: &str,
  ) -> Result<TokenResponse, CoreError> {
    let params = [
      ("grant_type", "authorization_code"),
      ("client_id", self.config.client_id.as_str()),
      ("client_secret", self.config.client_secret.as_str()),
      ("code", code),
      ("code_verifier", code_verifier),
      ("redirect_uri", &self.redirect_uri()),
    ];

    let resp = self
      .http
      .post(&self.config.token_url)
      .form(&params)
      .send()
      .await
      .map_err(|e| CoreError::Internal(format!("token exchange request failed: {}", e)))?;

    if !resp.status().is_success() {
      let status = resp.status();
      let body = resp.text().await.unwrap_or_default();
      warn!(%status, "token exchange rejected");
      debug!(body, "token endpoint error body");
      return Err(CoreError::AuthFailed(
        AuthFailureReason::InvalidAuthorizationCode,
      ));
    }

    resp
      .json::<TokenResponse>()
      .await
      .map_err(|e| CoreError::Internal(format!("token response malformed: {}", e)))
  }

  async fn jwks(&self) -> Result<JwkSet, CoreError> {
    {
      let cache = self.jwks_cache.read().await;
      if let Some((fetched_at, set)) = cache.as_ref() {
        if fetched_at.elapsed() < JWKS_CACHE_TTL {
          return Ok(set.clone());
        }
      }
    }

    let set: JwkSet = self
      .http
      .get(&self.config.jwks_url)
      .send()
      .await
      .map_err(|e| CoreError::Internal(format!("jwks fetch failed: {}", e)))?
      .json()
      .await
      .map_err(|e| CoreError::Internal(format!("jwks malformed: {}", e)))?;

    *self.jwks_cache.write().await = Some((Instant::now(), set.clone()));
    Ok(set)
  }

  /// Full ID-token validation: JWKS signature, issuer allow-list, audience,
  /// expiry.
  pub async fn validate_id_token(&self, id_token: &str) -> Result<IdTokenClaims, CoreError> {
    let header = decode_header(id_token)?;
    let kid = header.kid.ok_or(CoreError::TokenInvalid)?;

    let jwks = self.jwks().await?;
    let jwk = jwks.find(&kid).ok_or(CoreError::TokenInvalid)?;
    let key = DecodingKey::from_jwk(jwk)?;

    let mut validation = Validation::new(header.alg);
    validation.set_audience(&[&self.config.client_id]);
    let issuers: Vec<&str> = self.config.allowed_issuers.iter().map(|s| s.as_str()).collect();
    validation.set_issuer(&issuers);

    let data = decode::<IdTokenClaims>(id_token, &key, &validation)?;
    check_claims(&data.claims, &self.config.client_id, &self.config.allowed_issuers)?;
    Ok(data.claims)
  }

  /// Link the external account to an existing user by email, or create a new
  /// OAuth-only user (null password hash).
  pub async fn provision_or_link_user(
    &self,
    info: &OAuthUserInfo,
    default_profile: Option<serde_json::Value>,
  ) -> Result<User, CoreError> {
    let email = normalize_email(&info.email);

    if let Some(user) = self.users.find_by_email(&email).await? {
      if !user.has_linked_account(&self.name, &info.provider_user_id) {
        self
          .users
          .link_oauth_account(
            user.id,
            OAuthAccount {
              provider: self.name.clone(),
              provider_user_id: info.provider_user_id.clone(),
              linked_at: Utc::now(),
              profile_blob: info.profile_blob.clone(),
            },
          )
          .await?;
        info!(user_id = %user.id, provider = %self.name, "linked oauth account");
      }
      return Ok(user);
    }

    let user = self
      .users
      .insert(NewUser {
        email,
        email_verified: info.email_verified,
        auth_provider: format!("oauth:{}", self.name),
        password_hash: None,
        profile: default_profile.unwrap_or_else(|| serde_json::json!({})),
        oauth_accounts: vec![OAuthAccount {
          provider: self.name.clone(),
          provider_user_id: info.provider_user_id.clone(),
          linked_at: Utc::now(),
          profile_blob: info.profile_blob.clone(),
        }],
      })
      .await?;

    info!(user_id = %user.id, provider = %self.name, "provisioned oauth user");
    Ok(user)
  }

  async fn run_callback_flow(
    &self,
    code: &str,
    state: &str,
    default_profile: Option<serde_json::Value>,
    ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError> {
    // The state must match a pending session started by this process.
    let Some((_, pkce)) = self.pending.remove(state) else {
      return Ok(AuthResult::Failure {
        reason: AuthFailureReason::StateMismatch,
      });
    };
    pkce.verify_state(state)?;

    let tokens = self.exchange_code(code, &pkce.code_verifier).await?;
    let claims = self.validate_id_token(&tokens.id_token).await?;

    let info = OAuthUserInfo {
      provider_user_id: claims.sub.clone(),
      email: claims.email.clone(),
      email_verified: claims.email_verified,
      profile_blob: serde_json::json!({
        "name": claims.name,
        "picture": claims.picture,
      }),
    };
    let user = self.provision_or_link_user(&info, default_profile).await?;

    self
      .audit
      .append(
        AuditEvent::new(AuditEventType::LoginSuccess, true)
          .user(user.id)
          .email(user.email.clone())
          .provider(format!("oauth:{}", self.name))
          .ip_address(ctx.ip_address.clone()),
      )
      .await?;

    Ok(AuthResult::Success {
      user_id: user.id,
      email: user.email,
      metadata: Some(info.profile_blob),
    })
  }
}

#[async_trait]
impl CredentialProvider for OAuthProvider {
  fn name(&self) -> &str {
    &self.name
  }

  /// For OAuth, registration IS the first authentication; the supplied
  /// profile becomes the default for a newly provisioned user.
  #[instrument(skip(self, credentials, profile))]
  async fn register(
    &self,
    credentials: &Credentials,
    profile: serde_json::Value,
    ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError> {
    let Credentials::OAuthCallback { code, state } = credentials else {
      return Err(CoreError::Validation(
        "oauth registration requires an authorization code".to_string(),
      ));
    };
    self.run_callback_flow(code, state, Some(profile), ctx).await
  }

  #[instrument(skip(self, credentials))]
  async fn authenticate(
    &self,
    credentials: &Credentials,
    ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError> {
    let Credentials::OAuthCallback { code, state } = credentials else {
      return Err(CoreError::Validation(
        "oauth authentication requires an authorization code".to_string(),
      ));
    };
    self.run_callback_flow(code, state, None, ctx).await
  }
}

/// Claim checks that hold regardless of how the signature was verified.
fn check_claims(
  claims: &IdTokenClaims,
  client_id: &str,
  allowed_issuers: &[String],
) -> Result<(), CoreError> {
  if !allowed_issuers.iter().any(|iss| iss == &claims.iss) {
    tracing::debug!(iss = %claims.iss, "issuer not in allow-list");
    return Err(CoreError::TokenInvalid);
  }
  if claims.aud != client_id {
    tracing::debug!(aud = %claims.aud, "audience mismatch");
    return Err(CoreError::TokenInvalid);
  }
  if claims.exp <= Utc::now().timestamp() {
    return Err(CoreError::TokenInvalid);
  }
  Ok(())
}

/// Percent-encode a query value (unreserved characters pass through).
fn urlencode(s: &str) -> String {
  const HEX: &[u8; 16] = b"0123456789ABCDEF";
  let mut out = String::with_capacity(s.len());
  for b in s.bytes() {
    match b {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
        out.push(b as char);
      }
      _ => {
        out.push('%');
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domains::auth::test_support::{InMemoryAudit, InMemoryUsers};

  fn test_config() -> OAuthConfig {
    OAuthConfig {
      client_id: "client-123.apps.example".to_string(),
      client_secret: "secret".to_string(),
      auth_url: "https://accounts.example.com/auth".to_string(),
      token_url: "https://accounts.example.com/token".to_string(),
      jwks_url: "https://accounts.example.com/certs".to_string(),
      allowed_issuers: vec!["https://accounts.example.com".to_string()],
      redirect_port: 3000,
      scope: "openid email profile".to_string(),
      callback_timeout_secs: 300,
    }
  }

  fn provider(users: Arc<InMemoryUsers>, audit: Arc<InMemoryAudit>) -> OAuthProvider {
    OAuthProvider::new("google", test_config(), users, audit)
  }

  fn claims(iss: &str, aud: &str, exp_offset: i64) -> IdTokenClaims {
    IdTokenClaims {
      iss: iss.to_string(),
      aud: aud.to_string(),
      sub: "oauth-sub-1".to_string(),
      email: "alice@example.com".to_string(),
      email_verified: true,
      exp: Utc::now().timestamp() + exp_offset,
      iat: Utc::now().timestamp(),
      name: Some("Alice".to_string()),
      picture: None,
    }
  }

  #[test]
  fn authorization_url_carries_pkce_parameters() {
    let provider = provider(
      Arc::new(InMemoryUsers::default()),
      Arc::new(InMemoryAudit::default()),
    );
    let (url, state) = provider.start_authorization();

    assert!(url.starts_with("https://accounts.example.com/auth?"));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.contains("code_challenge="));
    assert!(url.contains(&format!("state={}", urlencode(&state))));
    assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2F"));
  }

  #[test]
  fn claim_checks_enforce_issuer_audience_expiry() {
    let cfg = test_config();
    let ok = claims("https://accounts.example.com", &cfg.client_id, 3600);
    assert!(check_claims(&ok, &cfg.client_id, &cfg.allowed_issuers).is_ok());

    let bad_iss = claims("https://evil.example.com", &cfg.client_id, 3600);
    assert!(check_claims(&bad_iss, &cfg.client_id, &cfg.allowed_issuers).is_err());

    let bad_aud = claims("https://accounts.example.com", "other-client", 3600);
    assert!(check_claims(&bad_aud, &cfg.client_id, &cfg.allowed_issuers).is_err());

    let expired = claims("https://accounts.example.com", &cfg.client_id, -10);
    assert!(check_claims(&expired, &cfg.client_id, &cfg.allowed_issuers).is_err());
  }

  #[tokio::test]
  async fn unknown_state_is_rejected_before_any_network_io() -> anyhow::Result<()> {
    let provider = provider(
      Arc::new(InMemoryUsers::default()),
      Arc::new(InMemoryAudit::default()),
    );

    let result = provider
      .authenticate(
        &Credentials::OAuthCallback {
          code: "code".to_string(),
          state: "never-issued".to_string(),
        },
        &RequestContext::default(),
      )
      .await?;

    assert!(matches!(
      result,
      AuthResult::Failure {
        reason: AuthFailureReason::StateMismatch
      }
    ));
    Ok(())
  }

  #[tokio::test]
  async fn provision_creates_then_links() -> anyhow::Result<()> {
    let users = Arc::new(InMemoryUsers::default());
    let provider = provider(users.clone(), Arc::new(InMemoryAudit::default()));

    let info = OAuthUserInfo {
      provider_user_id: "oauth-sub-1".to_string(),
      email: "Alice@Example.com".to_string(),
      email_verified: true,
      profile_blob: serde_json::json!({"name": "Alice"}),
    };

    let user = provider.provision_or_link_user(&info, None).await?;
    assert_eq!(user.email, "alice@example.com");
    assert!(user.password_hash.is_none());
    assert_eq!(user.auth_provider, "oauth:google");

    // Second sign-in with the same identity neither duplicates the user nor
    // re-links the account.
    let again = provider.provision_or_link_user(&info, None).await?;
    assert_eq!(again.id, user.id);
    assert_eq!(users.user_count(), 1);
    let stored = users.find_by_email("alice@example.com").await?.unwrap();
    assert_eq!(stored.oauth_accounts.len(), 1);
    Ok(())
  }

  #[test]
  fn urlencode_escapes_reserved_characters() {
    assert_eq!(urlencode("a b&c=d"), "a%20b%26c%3Dd");
    assert_eq!(urlencode("safe-_.~"), "safe-_.~");
  }
}
