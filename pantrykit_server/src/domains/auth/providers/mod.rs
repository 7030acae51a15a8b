//! Credential providers: small polymorphic values registered into the auth
//! service at construction time.

mod callback;
mod oauth;
mod password;

pub use callback::{CallbackOutcome, LocalCallbackServer};
pub use oauth::{IdTokenClaims, OAuthProvider, OAuthUserInfo, TokenResponse};
pub use password::PasswordProvider;

use async_trait::async_trait;

use pantrykit_core::contracts::RequestContext;
use pantrykit_core::error::CoreError;
use pantrykit_core::models::AuthResult;

/// What a caller presents to a provider. A sum type so a provider can reject
/// the wrong shape outright instead of probing optional fields.
#[derive(Debug, Clone)]
pub enum Credentials {
  Password { email: String, password: String },
  OAuthCallback { code: String, state: String },
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
  fn name(&self) -> &str;

  async fn register(
    &self,
    credentials: &Credentials,
    profile: serde_json::Value,
    ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError>;

  async fn authenticate(
    &self,
    credentials: &Credentials,
    ctx: &RequestContext,
  ) -> Result<AuthResult, CoreError>;

  fn supports_password_reset(&self) -> bool {
    false
  }

  fn supports_email_verification(&self) -> bool {
    false
  }
}
