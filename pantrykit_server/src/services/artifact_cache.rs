//! Two-tier artifact cache keyed by input content, mode, and optionally the
//! profile fingerprint that shaped the artifact.
//!
//! Entries whose fingerprint no longer matches the live profile are misses;
//! a profile edit invalidates everything the old profile produced.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AppError;

/// Profile fields that participate in the fingerprint, pre-sorted.
#[derive(Debug, Clone, Serialize)]
struct ProfileFingerprintFields {
  allergies: Vec<String>,
  diet_types: Vec<String>,
  cultural_restrictions: Vec<String>,
}

/// First 16 hex chars of SHA-256 over the sorted dietary fields. Profiles
/// that differ only in fields outside this set share a fingerprint.
pub fn profile_fingerprint(profile: &serde_json::Value) -> String {
  let mut fields = ProfileFingerprintFields {
    allergies: string_list(profile, "allergies"),
    diet_types: string_list(profile, "diet_types"),
    cultural_restrictions: string_list(profile, "cultural_restrictions"),
  };
  fields.allergies.sort();
  fields.diet_types.sort();
  fields.cultural_restrictions.sort();

  let serialized = serde_json::to_string(&fields).unwrap_or_default();
  let hash = Sha256::digest(serialized.as_bytes());
  hex::encode(hash)[..16].to_string()
}

fn string_list(profile: &serde_json::Value, key: &str) -> Vec<String> {
  profile
    .get(key)
    .and_then(|v| v.as_array())
    .map(|arr| {
      arr
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
    })
    .unwrap_or_default()
}

/// One cached artifact as persisted on disk, one JSON file per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArtifact {
  pub key: String,
  pub produced_at: DateTime<Utc>,
  pub profile_fingerprint: Option<String>,
  pub mode: String,
  pub invalidated: bool,
  pub payload: String,
}

pub struct ArtifactCache {
  cache_dir: PathBuf,
  ttl: Duration,
  memory: Mutex<HashMap<String, CachedArtifact>>,
}

impl ArtifactCache {
  pub fn new(cache_dir: impl Into<PathBuf>, ttl_hours: i64) -> Result<Self, AppError> {
    let cache_dir = cache_dir.into();
    std::fs::create_dir_all(&cache_dir)?;
    Ok(Self {
      cache_dir,
      ttl: Duration::hours(ttl_hours),
      memory: Mutex::new(HashMap::new()),
    })
  }

  pub fn cache_key(input_hash: &str, mode: &str, fingerprint: Option<&str>) -> String {
    match fingerprint {
      Some(fp) => format!("{}_{}_{}", input_hash, mode, fp),
      None => format!("{}_{}", input_hash, mode),
    }
  }

  fn entry_path(&self, key: &str) -> PathBuf {
    self.cache_dir.join(format!("{}.json", key))
  }

  /// Memory tier first, then disk. Disk entries are rejected when
  /// invalidated, expired, or produced under a different fingerprint; a
  /// surviving entry is rehydrated into memory.
  pub async fn lookup(
    &self,
    input_hash: &str,
    mode: &str,
    fingerprint: Option<&str>,
  ) -> Result<Option<String>, AppError> {
    let key = Self::cache_key(input_hash, mode, fingerprint);

    {
      let memory = self.memory.lock().await;
      if let Some(entry) = memory.get(&key) {
        if self.is_live(entry, fingerprint) {
          debug!(key, "cache hit (memory)");
          return Ok(Some(entry.payload.clone()));
        }
      }
    }

    let path = self.entry_path(&key);
    if !path.exists() {
      return Ok(None);
    }

    let entry = match read_entry(&path) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "dropping unreadable cache entry");
        let _ = std::fs::remove_file(&path);
        return Ok(None);
      }
    };

    if !self.is_live(&entry, fingerprint) {
      return Ok(None);
    }

    debug!(key, "cache hit (disk)");
    let payload = entry.payload.clone();
    self.memory.lock().await.insert(key, entry);
    Ok(Some(payload))
  }

  fn is_live(&self, entry: &CachedArtifact, fingerprint: Option<&str>) -> bool {
    if entry.invalidated {
      return false;
    }
    if Utc::now() - entry.produced_at > self.ttl {
      return false;
    }
    // A caller that requires a fingerprint only accepts an exact match.
    if fingerprint.is_some() && entry.profile_fingerprint.as_deref() != fingerprint {
      return false;
    }
    true
  }

  /// Write both tiers. The disk write goes through a sibling temp file and a
  /// rename, so readers observe the old entry or the new one, never a torn
  /// file.
  pub async fn insert(
    &self,
    input_hash: &str,
    mode: &str,
    fingerprint: Option<&str>,
    payload: String,
  ) -> Result<(), AppError> {
    let key = Self::cache_key(input_hash, mode, fingerprint);
    let entry = CachedArtifact {
      key: key.clone(),
      produced_at: Utc::now(),
      profile_fingerprint: fingerprint.map(str::to_string),
      mode: mode.to_string(),
      invalidated: false,
      payload,
    };

    let path = self.entry_path(&key);
    let tmp = self.cache_dir.join(format!(".{}.tmp", key));
    std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
    std::fs::rename(&tmp, &path)?;

    self.memory.lock().await.insert(key, entry);
    Ok(())
  }

  /// Mark every on-disk entry invalidated and clear the memory tier.
  /// Returns the number of entries touched. Called after any profile edit
  /// that changes a fingerprinted field.
  pub async fn invalidate_for_user(&self) -> Result<usize, AppError> {
    let mut count = 0;

    for path in self.entry_paths()? {
      match read_entry(&path) {
        Ok(mut entry) if !entry.invalidated => {
          entry.invalidated = true;
          let tmp = path.with_extension("json.tmp");
          std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
          std::fs::rename(&tmp, &path)?;
          count += 1;
        }
        Ok(_) => {}
        Err(e) => {
          warn!(path = %path.display(), error = %e, "skipping unreadable entry");
        }
      }
    }

    self.memory.lock().await.clear();
    info!(count, "invalidated cached artifacts");
    Ok(count)
  }

  /// Remove expired and invalidated entries from disk. Returns the count.
  pub async fn cleanup_expired(&self) -> Result<usize, AppError> {
    let mut removed = 0;

    for path in self.entry_paths()? {
      let stale = match read_entry(&path) {
        Ok(entry) => entry.invalidated || Utc::now() - entry.produced_at > self.ttl,
        Err(_) => true,
      };
      if stale {
        std::fs::remove_file(&path)?;
        removed += 1;
      }
    }

    let mut memory = self.memory.lock().await;
    let ttl = self.ttl;
    memory.retain(|_, e| !e.invalidated && Utc::now() - e.produced_at <= ttl);

    Ok(removed)
  }

  fn entry_paths(&self) -> Result<Vec<PathBuf>, AppError> {
    let mut paths = Vec::new();
    for dir_entry in std::fs::read_dir(&self.cache_dir)? {
      let path = dir_entry?.path();
      if path.extension().is_some_and(|ext| ext == "json") {
        paths.push(path);
      }
    }
    Ok(paths)
  }
}

fn read_entry(path: &Path) -> Result<CachedArtifact, AppError> {
  let bytes = std::fs::read(path)?;
  Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn cache(dir: &TempDir) -> ArtifactCache {
    ArtifactCache::new(dir.path(), 12).unwrap()
  }

  fn profile(allergies: &[&str]) -> serde_json::Value {
    serde_json::json!({
      "allergies": allergies,
      "diet_types": ["vegetarian"],
      "cultural_restrictions": [],
    })
  }

  #[test]
  fn fingerprint_ignores_field_order_and_unrelated_fields() {
    let a = serde_json::json!({
      "allergies": ["nuts", "dairy"],
      "diet_types": ["vegan"],
      "cultural_restrictions": [],
      "favorite_color": "green",
    });
    let b = serde_json::json!({
      "cultural_restrictions": [],
      "diet_types": ["vegan"],
      "allergies": ["dairy", "nuts"],
    });
    assert_eq!(profile_fingerprint(&a), profile_fingerprint(&b));
    assert_eq!(profile_fingerprint(&a).len(), 16);
  }

  #[test]
  fn fingerprint_changes_with_dietary_fields() {
    assert_ne!(
      profile_fingerprint(&profile(&["nuts"])),
      profile_fingerprint(&profile(&["nuts", "dairy"]))
    );
  }

  #[tokio::test]
  async fn insert_then_lookup_both_tiers() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = cache(&dir);
    let fp = profile_fingerprint(&profile(&["nuts"]));

    cache
      .insert("0xAB", "recipes", Some(&fp), "payload-1".to_string())
      .await?;

    // Memory hit.
    assert_eq!(
      cache.lookup("0xAB", "recipes", Some(&fp)).await?.as_deref(),
      Some("payload-1")
    );

    // Disk hit after the memory tier is gone (fresh cache over same dir).
    let cold = ArtifactCache::new(dir.path(), 12)?;
    assert_eq!(
      cold.lookup("0xAB", "recipes", Some(&fp)).await?.as_deref(),
      Some("payload-1")
    );
    Ok(())
  }

  #[tokio::test]
  async fn profile_change_misses_and_invalidation_kills_old_entries() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = cache(&dir);
    let old_fp = profile_fingerprint(&profile(&["nuts"]));

    cache
      .insert("0xAB", "recipes", Some(&old_fp), "old-recipes".to_string())
      .await?;

    // Dairy added to allergies: new fingerprint must miss.
    let new_fp = profile_fingerprint(&profile(&["nuts", "dairy"]));
    assert!(cache.lookup("0xAB", "recipes", Some(&new_fp)).await?.is_none());

    // After invalidation the ORIGINAL fingerprint must miss too.
    let count = cache.invalidate_for_user().await?;
    assert_eq!(count, 1);
    assert!(cache.lookup("0xAB", "recipes", Some(&old_fp)).await?.is_none());
    Ok(())
  }

  #[tokio::test]
  async fn mode_and_fingerprint_partition_the_key_space() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = cache(&dir);
    let fp = profile_fingerprint(&profile(&["nuts"]));

    cache
      .insert("0xAB", "items", None, "item-list".to_string())
      .await?;
    cache
      .insert("0xAB", "recipes", Some(&fp), "recipe-list".to_string())
      .await?;

    assert_eq!(
      cache.lookup("0xAB", "items", None).await?.as_deref(),
      Some("item-list")
    );
    assert_eq!(
      cache.lookup("0xAB", "recipes", Some(&fp)).await?.as_deref(),
      Some("recipe-list")
    );
    assert!(cache.lookup("0xCD", "items", None).await?.is_none());
    Ok(())
  }

  #[tokio::test]
  async fn cleanup_removes_invalidated_entries() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = cache(&dir);

    cache.insert("0x01", "items", None, "a".to_string()).await?;
    cache.insert("0x02", "items", None, "b".to_string()).await?;
    cache.invalidate_for_user().await?;

    let removed = cache.cleanup_expired().await?;
    assert_eq!(removed, 2);
    assert!(cache.entry_paths()?.is_empty());
    Ok(())
  }

  #[tokio::test]
  async fn corrupt_entries_are_dropped_not_fatal() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = cache(&dir);

    std::fs::write(dir.path().join("garbage_items.json"), b"not json")?;
    assert!(cache.lookup("garbage", "items", None).await?.is_none());
    Ok(())
  }
}
