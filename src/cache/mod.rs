//! Per-key disk cache
//!
//! Each key maps to one file under the cache root, named by the SHA-256 of
//! the key. Writes land in a temporary sibling and are renamed into place,
//! so readers only ever observe complete records.

mod entry;
mod key;

pub use entry::{CacheEntry, DecodeError, MAX_META_FIELD_BYTES};
pub use key::{cache_key, key_file_name};

use anyhow::Context;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Shared handle to the cache directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    max_content_bytes: usize,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, max_content_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_content_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key_file_name(key))
    }

    /// Persist `entry` under `key`, logging and dropping any I/O failure.
    pub async fn put(&self, key: &str, entry: &CacheEntry) {
        match self.store(key, entry).await {
            Ok(()) => tracing::info!(
                "Cached {} ({} bytes, type {:?})",
                key,
                entry.content.len(),
                entry.content_type
            ),
            Err(err) => tracing::warn!("Failed to write cache entry for {}: {:#}", key, err),
        }
    }

    /// Persist `entry` under `key`, replacing any previous record.
    pub async fn store(&self, key: &str, entry: &CacheEntry) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache directory {}", self.root.display()))?;

        let target = self.path_for(key);
        let staging = self
            .root
            .join(format!(".{}.{}.tmp", key_file_name(key), uuid::Uuid::new_v4()));

        if let Err(err) = tokio::fs::write(&staging, entry.encode()).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err).with_context(|| format!("writing {}", staging.display()));
        }
        if let Err(err) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err).with_context(|| format!("replacing {}", target.display()));
        }
        Ok(())
    }

    /// Look up `key`. Missing, unreadable and corrupt records all read as `None`.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!("Failed to read cache file {}: {}", path.display(), err);
                return None;
            }
        };

        match CacheEntry::decode(&data, self.max_content_bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!("Ignoring corrupt cache file {}: {}", path.display(), err);
                None
            }
        }
    }
}
