use argon2::{
  password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
  Argon2, Params, PasswordHash, PasswordVerifier,
};
use pantrykit_core::error::CoreError;

/// Passwords rejected outright regardless of composition.
const COMMON_PASSWORDS: &[&str] = &[
  "password", "password1", "password123", "12345678", "123456789", "1234567890", "qwerty123",
  "qwertyuiop", "letmein1", "welcome1", "admin123", "iloveyou1", "sunshine1", "monkey123",
  "dragon123", "baseball1", "football1", "superman1", "trustno1", "changeme1",
];

/// Generate a password hash with the configured time cost.
pub fn hashed_password(password: &str, cost: u32) -> Result<String, CoreError> {
  let salt = SaltString::generate(&mut OsRng);

  let params = Params::new(19_456, cost, 1, None)
    .map_err(|e| CoreError::Internal(e.to_string()))?;
  let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

  let password_hash = argon2
    .hash_password(password.as_bytes(), &salt)
    .map_err(|e| CoreError::Internal(e.to_string()))?
    .to_string();

  Ok(password_hash)
}

/// Verify a password against a stored hash. Cost parameters are read from
/// the hash itself.
pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, CoreError> {
  let argon2 = Argon2::default();
  let parsed_hash =
    PasswordHash::new(password_hash).map_err(|e| CoreError::Internal(e.to_string()))?;

  let is_valid = argon2
    .verify_password(password.as_bytes(), &parsed_hash)
    .is_ok();

  Ok(is_valid)
}

/// Password policy: minimum 8 chars with upper, lower, digit, and symbol;
/// not a known-common password; not containing the email local-part.
pub fn validate_password(password: &str, email: &str) -> Result<(), CoreError> {
  if password.len() < 8 {
    return Err(CoreError::Validation(
      "password must be at least 8 characters long".to_string(),
    ));
  }
  if password.len() > 128 {
    return Err(CoreError::Validation(
      "password must be no more than 128 characters long".to_string(),
    ));
  }
  let lowered = password.to_lowercase();
  if COMMON_PASSWORDS.contains(&lowered.as_str()) {
    return Err(CoreError::Validation(
      "password is too common".to_string(),
    ));
  }

  if !password.chars().any(|c| c.is_ascii_uppercase()) {
    return Err(CoreError::Validation(
      "password must contain an uppercase letter".to_string(),
    ));
  }
  if !password.chars().any(|c| c.is_ascii_lowercase()) {
    return Err(CoreError::Validation(
      "password must contain a lowercase letter".to_string(),
    ));
  }
  if !password.chars().any(|c| c.is_ascii_digit()) {
    return Err(CoreError::Validation(
      "password must contain a digit".to_string(),
    ));
  }
  if password.chars().all(|c| c.is_ascii_alphanumeric()) {
    return Err(CoreError::Validation(
      "password must contain a symbol".to_string(),
    ));
  }

  if let Some(local_part) = email.split('@').next() {
    if local_part.len() >= 3 && lowered.contains(&local_part.to_lowercase()) {
      return Err(CoreError::Validation(
        "password must not contain your email address".to_string(),
      ));
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn password_hashing_should_work() -> Result<(), Box<dyn std::error::Error>> {
    let password = "Correct-Horse-9!";
    let hash = hashed_password(password, 2)?;

    assert!(!hash.is_empty());
    assert!(verify_password(password, &hash)?);
    assert!(!verify_password("wrong_password", &hash)?);

    Ok(())
  }

  #[test]
  fn different_passwords_should_have_different_hashes() -> Result<(), Box<dyn std::error::Error>> {
    let hash1 = hashed_password("Str0ng-One!", 2)?;
    let hash2 = hashed_password("Str0ng-Two!", 2)?;

    assert_ne!(hash1, hash2);

    Ok(())
  }

  #[test]
  fn policy_accepts_a_strong_password() {
    assert!(validate_password("Correct-Horse-9!", "alice@example.com").is_ok());
  }

  #[test]
  fn policy_rejects_weak_shapes() {
    let email = "alice@example.com";
    assert!(validate_password("Sh0rt!", email).is_err()); // too short
    assert!(validate_password("lowercase-only-9!", email).is_err()); // no upper
    assert!(validate_password("UPPERCASE-ONLY-9!", email).is_err()); // no lower
    assert!(validate_password("No-Digits-Here!", email).is_err()); // no digit
    assert!(validate_password("NoSymbols123abc", email).is_err()); // no symbol
  }

  #[test]
  fn policy_rejects_common_passwords() {
    // Caught by the common set before composition is even considered.
    assert!(validate_password("Password123", "x@y.com").is_err());
    assert!(validate_password("Trustno1", "x@y.com").is_err());
  }

  #[test]
  fn policy_rejects_email_local_part() {
    assert!(validate_password("Alice-Rocks-99!", "alice@example.com").is_err());
    // Same password is fine for someone else.
    assert!(validate_password("Alice-Rocks-99!", "bob@example.com").is_ok());
  }
}
