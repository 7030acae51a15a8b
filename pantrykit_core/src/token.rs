use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::UserId;

const JWT_ISSUER: &str = "pantrykit";
/// Signing secrets shorter than this are rejected outright.
pub const MIN_SECRET_BYTES: usize = 32;

pub const ACCESS_TOKEN_EXPIRATION: i64 = 15 * 60; // 15 minutes
pub const REFRESH_TOKEN_EXPIRATION: i64 = 30 * 24 * 60 * 60; // 30 days
pub const RESET_TOKEN_EXPIRATION: i64 = 60 * 60; // 1 hour

/// The three disjoint token kinds. A token of one kind never validates as
/// another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
  Access,
  Refresh,
  Reset,
}

impl TokenKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      TokenKind::Access => "access",
      TokenKind::Refresh => "refresh",
      TokenKind::Reset => "reset",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
  pub sub: String,
  pub email: String,
  pub iat: i64,
  pub exp: i64,
  pub jti: String,
  pub token_type: TokenKind,
  pub iss: String,
}

impl TokenClaims {
  pub fn user_id(&self) -> Result<UserId, CoreError> {
    self
      .sub
      .parse::<i64>()
      .map(UserId)
      .map_err(|_| CoreError::TokenInvalid)
  }

  pub fn expires_at(&self) -> DateTime<Utc> {
    DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
  }
}

/// A freshly issued access/refresh pair together with both JTIs, so the
/// session row can be written before the pair is handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
  pub access_token: String,
  pub access_jti: String,
  pub refresh_token: String,
  pub refresh_jti: String,
  pub access_expires_at: DateTime<Utc>,
  pub refresh_expires_at: DateTime<Utc>,
}

/// Per-token random 128-bit identifier, hex encoded.
pub fn generate_jti() -> String {
  let mut random_bytes = [0u8; 16];
  rand::thread_rng().fill(&mut random_bytes);
  hex::encode(random_bytes)
}

#[derive(Debug, Clone)]
pub struct TokenLifetimes {
  pub access_secs: i64,
  pub refresh_secs: i64,
  pub reset_secs: i64,
}

impl Default for TokenLifetimes {
  fn default() -> Self {
    Self {
      access_secs: ACCESS_TOKEN_EXPIRATION,
      refresh_secs: REFRESH_TOKEN_EXPIRATION,
      reset_secs: RESET_TOKEN_EXPIRATION,
    }
  }
}

/// Issues and validates the three token kinds with a shared symmetric secret.
#[derive(Clone)]
pub struct TokenService {
  encoding_key: EncodingKey,
  decoding_key: DecodingKey,
  validation: Validation,
  lifetimes: TokenLifetimes,
}

impl std::fmt::Debug for TokenService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TokenService")
      .field("lifetimes", &self.lifetimes)
      .finish_non_exhaustive()
  }
}

impl TokenService {
  /// The secret must come from configuration; anything under 32 bytes is
  /// refused so an insecure default can never slip through.
  pub fn new(secret: &str, lifetimes: TokenLifetimes) -> Result<Self, CoreError> {
    if secret.len() < MIN_SECRET_BYTES {
      return Err(CoreError::Validation(format!(
        "token signing secret must be at least {} bytes",
        MIN_SECRET_BYTES
      )));
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);
    validation.set_issuer(&[JWT_ISSUER]);

    Ok(Self {
      encoding_key: EncodingKey::from_secret(secret.as_bytes()),
      decoding_key: DecodingKey::from_secret(secret.as_bytes()),
      validation,
      lifetimes,
    })
  }

  pub fn issue_access(&self, user_id: UserId, email: &str) -> Result<(String, TokenClaims), CoreError> {
    self.issue(user_id, email, TokenKind::Access, self.lifetimes.access_secs)
  }

  pub fn issue_refresh(&self, user_id: UserId, email: &str) -> Result<(String, TokenClaims), CoreError> {
    self.issue(user_id, email, TokenKind::Refresh, self.lifetimes.refresh_secs)
  }

  pub fn issue_reset(&self, user_id: UserId, email: &str) -> Result<(String, TokenClaims), CoreError> {
    self.issue(user_id, email, TokenKind::Reset, self.lifetimes.reset_secs)
  }

  /// Issue an access/refresh pair for one session row.
  pub fn issue_pair(&self, user_id: UserId, email: &str) -> Result<TokenPair, CoreError> {
    let (access_token, access) = self.issue_access(user_id, email)?;
    let (refresh_token, refresh) = self.issue_refresh(user_id, email)?;
    let access_expires_at = access.expires_at();
    let refresh_expires_at = refresh.expires_at();
    Ok(TokenPair {
      access_token,
      access_jti: access.jti,
      refresh_token,
      refresh_jti: refresh.jti,
      access_expires_at,
      refresh_expires_at,
    })
  }

  fn issue(
    &self,
    user_id: UserId,
    email: &str,
    kind: TokenKind,
    ttl_secs: i64,
  ) -> Result<(String, TokenClaims), CoreError> {
    let now = Utc::now().timestamp();
    let claims = TokenClaims {
      sub: user_id.to_string(),
      email: email.to_string(),
      iat: now,
      exp: now + ttl_secs,
      jti: generate_jti(),
      token_type: kind,
      iss: JWT_ISSUER.to_string(),
    };

    let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
    Ok((token, claims))
  }

  /// Valid iff the signature verifies, the kind matches, and the token is
  /// unexpired. Callers get a uniform [`CoreError::TokenInvalid`] on any
  /// failure; the distinction is only logged.
  pub fn validate(&self, token: &str, expected: TokenKind) -> Result<TokenClaims, CoreError> {
    let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)?;
    if data.claims.token_type != expected {
      tracing::debug!(
        expected = expected.as_str(),
        actual = data.claims.token_type.as_str(),
        "token kind mismatch"
      );
      return Err(CoreError::TokenInvalid);
    }
    Ok(data.claims)
  }

  /// Decode without verifying signature or expiry. For revocation lookups
  /// only, never for authorization.
  pub fn decode_unchecked(&self, token: &str) -> Result<TokenClaims, CoreError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use anyhow::Result;

  const SECRET: &str = "0123456789abcdef0123456789abcdef";

  fn service() -> TokenService {
    TokenService::new(SECRET, TokenLifetimes::default()).unwrap()
  }

  #[test]
  fn short_secret_is_rejected() {
    let err = TokenService::new("too-short", TokenLifetimes::default());
    assert!(matches!(err, Err(CoreError::Validation(_))));
  }

  #[test]
  fn issue_validate_round_trip() -> Result<()> {
    let svc = service();
    let (token, issued) = svc.issue_access(UserId(42), "alice@example.com")?;

    let claims = svc.validate(&token, TokenKind::Access)?;
    assert_eq!(claims.user_id()?, UserId(42));
    assert_eq!(claims.email, "alice@example.com");
    assert_eq!(claims.token_type, TokenKind::Access);
    assert_eq!(claims.jti, issued.jti);
    Ok(())
  }

  #[test]
  fn kinds_are_disjoint() -> Result<()> {
    let svc = service();
    let (refresh, _) = svc.issue_refresh(UserId(1), "a@b.com")?;
    let (reset, _) = svc.issue_reset(UserId(1), "a@b.com")?;

    assert!(matches!(
      svc.validate(&refresh, TokenKind::Access),
      Err(CoreError::TokenInvalid)
    ));
    assert!(matches!(
      svc.validate(&reset, TokenKind::Refresh),
      Err(CoreError::TokenInvalid)
    ));
    Ok(())
  }

  #[test]
  fn expired_tokens_fail_closed() -> Result<()> {
    let lifetimes = TokenLifetimes {
      access_secs: -10,
      ..TokenLifetimes::default()
    };
    let svc = TokenService::new(SECRET, lifetimes)?;
    let (token, _) = svc.issue_access(UserId(1), "a@b.com")?;

    assert!(matches!(
      svc.validate(&token, TokenKind::Access),
      Err(CoreError::TokenInvalid)
    ));
    Ok(())
  }

  #[test]
  fn tampered_signature_fails() -> Result<()> {
    let svc = service();
    let (token, _) = svc.issue_access(UserId(1), "a@b.com")?;

    let other = TokenService::new("ffffffffffffffffffffffffffffffff", TokenLifetimes::default())?;
    assert!(matches!(
      other.validate(&token, TokenKind::Access),
      Err(CoreError::TokenInvalid)
    ));
    Ok(())
  }

  #[test]
  fn decode_unchecked_reads_revoked_jti_from_expired_token() -> Result<()> {
    let lifetimes = TokenLifetimes {
      access_secs: -10,
      ..TokenLifetimes::default()
    };
    let svc = TokenService::new(SECRET, lifetimes)?;
    let (token, issued) = svc.issue_access(UserId(7), "a@b.com")?;

    let claims = svc.decode_unchecked(&token)?;
    assert_eq!(claims.jti, issued.jti);
    assert_eq!(claims.user_id()?, UserId(7));
    Ok(())
  }

  #[test]
  fn jti_is_128_bits_of_hex() {
    let jti = generate_jti();
    assert_eq!(jti.len(), 32); // 16 bytes => 32 hex chars
    assert_ne!(jti, generate_jti());
  }

  #[test]
  fn pair_carries_both_jtis() -> Result<()> {
    let svc = service();
    let pair = svc.issue_pair(UserId(3), "c@d.com")?;

    let access = svc.validate(&pair.access_token, TokenKind::Access)?;
    let refresh = svc.validate(&pair.refresh_token, TokenKind::Refresh)?;
    assert_eq!(access.jti, pair.access_jti);
    assert_eq!(refresh.jti, pair.refresh_jti);
    assert_ne!(pair.access_jti, pair.refresh_jti);
    Ok(())
  }
}
