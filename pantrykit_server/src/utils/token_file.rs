//! Single-user CLI token persistence: `$HOME/.pantrykit/auth_token`, owner
//! read/write only.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::AppError;

const APP_DIR: &str = ".pantrykit";
const TOKEN_FILE: &str = "auth_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
  pub access_token: String,
  pub refresh_token: String,
}

pub struct TokenFile {
  path: PathBuf,
}

impl TokenFile {
  /// Default location under the user's home directory.
  pub fn default_location() -> Result<Self, AppError> {
    let home = std::env::var("HOME")
      .map_err(|_| AppError::ConfigMissing("HOME is not set".to_string()))?;
    Ok(Self::at(Path::new(&home).join(APP_DIR).join(TOKEN_FILE)))
  }

  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn save(&self, tokens: &StoredTokens) -> Result<(), AppError> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
      restrict_dir(parent)?;
    }

    let tmp = self.path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(tokens)?)?;
    restrict_file(&tmp)?;
    std::fs::rename(&tmp, &self.path)?;
    Ok(())
  }

  pub fn load(&self) -> Result<Option<StoredTokens>, AppError> {
    if !self.path.exists() {
      return Ok(None);
    }
    let bytes = std::fs::read(&self.path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
  }

  /// Remove the stored tokens. Idempotent.
  pub fn clear(&self) -> Result<(), AppError> {
    if self.path.exists() {
      std::fs::remove_file(&self.path)?;
    }
    Ok(())
  }
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<(), AppError> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
  Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<(), AppError> {
  Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<(), AppError> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
  Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<(), AppError> {
  Ok(())
}
