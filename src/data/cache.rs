//! Three-tier on-disk user cache
//!
//! Three independent namespaces, one directory each, one JSON file per
//! entry (filename = identifier):
//!
//! - `lookups/`       handle -> numeric id          (long TTL)
//! - `profiles/`      id -> profile                 (medium TTL)
//! - `relationships/` id -> relationship snapshot   (short TTL)
//!
//! A read re-checks the TTL at access time; an absent, malformed, or
//! expired file is a miss and is unlinked. Writes are truncate-then-write;
//! a concurrent reader sees the old file, the new file, or a torn file it
//! treats as a miss.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::CacheConfig;
use crate::data::models::{Relationship, UserProfile};
use crate::error::{AppError, Result};

const LOOKUPS_DIR: &str = "lookups";
const PROFILES_DIR: &str = "profiles";
const RELATIONSHIPS_DIR: &str = "relationships";

/// Self-describing on-disk record
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry<T> {
    identifier: String,
    captured_at: DateTime<Utc>,
    value: T,
}

/// Cache coverage for one identifier, as seen by the batcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Lookup, profile, and relationship all present and fresh.
    Full,
    /// Some tiers present; the rest must be fetched.
    Partial,
    /// Nothing usable cached.
    Miss,
}

/// Three-tier user cache rooted at a single directory
pub struct UserCache {
    root: PathBuf,
    lookup_ttl: Duration,
    profile_ttl: Duration,
    relationship_ttl: Duration,
    profile_max_entries: usize,
    relationship_max_entries: usize,
}

impl UserCache {
    /// Open (and create if needed) the cache directories.
    pub fn open(root: &Path, config: &CacheConfig) -> Result<Self> {
        for dir in [LOOKUPS_DIR, PROFILES_DIR, RELATIONSHIPS_DIR] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| {
                AppError::Config(format!(
                    "cannot create cache directory {}: {}",
                    root.join(dir).display(),
                    e
                ))
            })?;
        }

        let cache = Self {
            root: root.to_path_buf(),
            lookup_ttl: Duration::from_secs(config.lookup_ttl_secs),
            profile_ttl: Duration::from_secs(config.profile_ttl_secs),
            relationship_ttl: Duration::from_secs(config.relationship_ttl_secs),
            profile_max_entries: config.profile_max_entries,
            relationship_max_entries: config.relationship_max_entries,
        };
        cache.evict_excess();
        Ok(cache)
    }

    // -------------------------------------------------------------------------
    // Lookup tier (handle -> id)
    // -------------------------------------------------------------------------

    pub fn get_lookup(&self, handle: &str) -> Option<String> {
        self.read_entry(LOOKUPS_DIR, handle, self.lookup_ttl)
    }

    pub fn put_lookup(&self, handle: &str, id: &str) {
        self.write_entry(LOOKUPS_DIR, handle, &id.to_string());
    }

    // -------------------------------------------------------------------------
    // Profile tier (id -> profile)
    // -------------------------------------------------------------------------

    pub fn get_profile(&self, id: &str) -> Option<UserProfile> {
        self.read_entry(PROFILES_DIR, id, self.profile_ttl)
    }

    pub fn put_profile(&self, id: &str, profile: &UserProfile) {
        self.write_entry(PROFILES_DIR, id, profile);
    }

    // -------------------------------------------------------------------------
    // Relationship tier (id -> relationship)
    // -------------------------------------------------------------------------

    pub fn get_relationship(&self, id: &str) -> Option<Relationship> {
        self.read_entry(RELATIONSHIPS_DIR, id, self.relationship_ttl)
    }

    pub fn put_relationship(&self, id: &str, relationship: &Relationship) {
        self.write_entry(RELATIONSHIPS_DIR, id, relationship);
    }

    /// Drop the relationship entry after a successful block so a later run
    /// does not skip the target as already-blocked on stale data. The
    /// profile entry is intentionally kept.
    pub fn invalidate_relationship(&self, id: &str) {
        if let Some(path) = self.entry_path(RELATIONSHIPS_DIR, id) {
            let _ = std::fs::remove_file(path);
        }
    }

    // -------------------------------------------------------------------------
    // Coverage analysis
    // -------------------------------------------------------------------------

    /// Classify cache coverage for a batch of handles. Drives the batcher's
    /// minimum-necessary-call planning.
    pub fn coverage_for_handles(&self, handles: &[String]) -> Vec<(String, Coverage)> {
        handles
            .iter()
            .map(|handle| {
                let coverage = match self.get_lookup(handle) {
                    None => Coverage::Miss,
                    Some(id) => {
                        let profile = self.get_profile(&id).is_some();
                        let relationship = self.get_relationship(&id).is_some();
                        match (profile, relationship) {
                            (true, true) => Coverage::Full,
                            _ => Coverage::Partial,
                        }
                    }
                };
                (handle.clone(), coverage)
            })
            .collect()
    }

    /// Coverage for numeric ids (no lookup tier involved).
    pub fn coverage_for_ids(&self, ids: &[String]) -> Vec<(String, Coverage)> {
        ids.iter()
            .map(|id| {
                let profile = self.get_profile(id).is_some();
                let relationship = self.get_relationship(id).is_some();
                let coverage = match (profile, relationship) {
                    (true, true) => Coverage::Full,
                    (false, false) => Coverage::Miss,
                    _ => Coverage::Partial,
                };
                (id.clone(), coverage)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Size management
    // -------------------------------------------------------------------------

    /// Evict oldest-by-mtime entries from the bounded tiers until below
    /// their ceilings. Opportunistic: called at open and after large
    /// batches, never on a hot request.
    pub fn evict_excess(&self) {
        self.evict_tier(PROFILES_DIR, self.profile_max_entries);
        self.evict_tier(RELATIONSHIPS_DIR, self.relationship_max_entries);
    }

    fn evict_tier(&self, dir: &str, max_entries: usize) {
        let tier = self.root.join(dir);
        let Ok(entries) = std::fs::read_dir(&tier) else {
            return;
        };

        let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((entry.path(), meta.modified().ok()?))
            })
            .collect();

        if files.len() <= max_entries {
            return;
        }

        files.sort_by_key(|(_, mtime)| *mtime);
        let excess = files.len() - max_entries;
        let mut removed = 0usize;
        for (path, _) in files.into_iter().take(excess) {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(tier = dir, removed, "evicted cache entries over ceiling");
        }
    }

    // -------------------------------------------------------------------------
    // Entry I/O
    // -------------------------------------------------------------------------

    /// Identifiers become filenames directly; anything outside the
    /// upstream's identifier alphabet is not cacheable.
    fn entry_path(&self, dir: &str, identifier: &str) -> Option<PathBuf> {
        if identifier.is_empty()
            || !identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }
        Some(self.root.join(dir).join(identifier))
    }

    fn read_entry<T: DeserializeOwned>(
        &self,
        dir: &str,
        identifier: &str,
        ttl: Duration,
    ) -> Option<T> {
        let path = self.entry_path(dir, identifier)?;
        let raw = std::fs::read_to_string(&path).ok()?;

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(_) => {
                // Torn or corrupt file: treat as a miss and drop it.
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(entry.captured_at);
        if age.num_seconds() < 0 || age.to_std().map(|a| a > ttl).unwrap_or(true) {
            let _ = std::fs::remove_file(&path);
            return None;
        }

        Some(entry.value)
    }

    fn write_entry<T: Serialize>(&self, dir: &str, identifier: &str, value: &T) {
        let Some(path) = self.entry_path(dir, identifier) else {
            tracing::warn!(identifier, "identifier not cacheable, skipping");
            return;
        };

        let entry = CacheEntry {
            identifier: identifier.to_string(),
            captured_at: Utc::now(),
            value,
        };

        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(error) = std::fs::write(&path, bytes) {
                    tracing::warn!(%error, path = %path.display(), "cache write failed");
                }
            }
            Err(error) => {
                tracing::warn!(%error, identifier, "cache entry serialization failed");
            }
        }
    }
}
