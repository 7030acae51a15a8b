//! OAuth authorization code + PKCE (RFC 7636) primitives.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// One in-flight authorization attempt. The verifier never leaves the
/// process; only the challenge goes into the authorization URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceSession {
  pub code_verifier: String,
  pub code_challenge: String,
  pub state: String,
  pub challenge_method: String,
}

impl PkceSession {
  pub fn new() -> Self {
    let code_verifier = generate_code_verifier();
    let code_challenge = compute_code_challenge(&code_verifier);
    Self {
      code_verifier,
      code_challenge,
      state: generate_state(),
      challenge_method: "S256".to_string(),
    }
  }

  /// Constant-shape state comparison; a mismatch means the callback does not
  /// belong to this flow.
  pub fn verify_state(&self, returned_state: &str) -> Result<(), CoreError> {
    if self.state != returned_state {
      return Err(CoreError::AuthFailed(
        crate::error::AuthFailureReason::StateMismatch,
      ));
    }
    Ok(())
  }
}

impl Default for PkceSession {
  fn default() -> Self {
    Self::new()
  }
}

/// Generate a PKCE code verifier (43-128 char URL-safe random string).
pub fn generate_code_verifier() -> String {
  let mut bytes = [0u8; 32];
  rand::thread_rng().fill(&mut bytes);
  URL_SAFE_NO_PAD.encode(bytes)
}

/// code_challenge = base64url_nopad(sha256(verifier)).
pub fn compute_code_challenge(verifier: &str) -> String {
  let hash = Sha256::digest(verifier.as_bytes());
  URL_SAFE_NO_PAD.encode(hash)
}

/// Random state parameter (128 bits, URL-safe).
pub fn generate_state() -> String {
  let mut bytes = [0u8; 16];
  rand::thread_rng().fill(&mut bytes);
  URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn verifier_length_is_within_rfc_bounds() {
    let verifier = generate_code_verifier();
    assert!(verifier.len() >= 43 && verifier.len() <= 128);
    assert!(verifier
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
  }

  #[test]
  fn challenge_matches_rfc_7636_appendix_b() {
    // Test vector from RFC 7636 Appendix B.
    let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    assert_eq!(
      compute_code_challenge(verifier),
      "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
    );
  }

  #[test]
  fn state_mismatch_is_rejected() {
    let session = PkceSession::new();
    assert!(session.verify_state(&session.state.clone()).is_ok());
    assert!(session.verify_state("forged").is_err());
  }

  #[test]
  fn sessions_are_unique() {
    let a = PkceSession::new();
    let b = PkceSession::new();
    assert_ne!(a.code_verifier, b.code_verifier);
    assert_ne!(a.state, b.state);
    assert_eq!(a.challenge_method, "S256");
  }
}
