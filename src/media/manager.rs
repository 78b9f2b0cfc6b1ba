//! Disk-backed asset storage fronted by the in-memory cache.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{AssetCache, CacheError};
use crate::plugin::{PluginError, PluginResult};

/// Content-addressed store for plugin media.
///
/// Asset ids are `<sha256>.<ext>`; the file on disk is the source of truth
/// and the cache only holds recently read assets.
pub struct MediaManager {
    root: PathBuf,
    cache: AssetCache,
}

impl MediaManager {
    pub fn new(root: impl Into<PathBuf>, cache_size: u64) -> Self {
        Self { root: root.into(), cache: AssetCache::new(cache_size) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Store an asset and return its id.
    pub async fn upload(&self, bytes: &[u8], extension: &str) -> PluginResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = format!("{:x}", hasher.finalize());

        let id = if extension.is_empty() { digest } else { format!("{digest}.{extension}") };
        validate_id(&id)?;

        let path = self.root.join(&id);
        let intact = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len() == bytes.len() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !intact {
            self.write_atomic(&path, bytes).await?;
            tracing::debug!(asset = %id, size = bytes.len(), "Stored asset");
        }

        self.cache_quietly(&id, bytes);
        Ok(id)
    }

    // Readers only ever see a missing or a complete file.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> PluginResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        // Leading dot: never a valid asset id.
        let staging = self.root.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&staging, bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read an asset: cache first, then disk.
    pub async fn get(&self, id: &str) -> PluginResult<Option<Vec<u8>>> {
        validate_id(id)?;

        if let Some(bytes) = self.cache.get(id) {
            return Ok(Some(bytes.to_vec()));
        }

        match tokio::fs::read(self.root.join(id)).await {
            Ok(bytes) => {
                self.cache_quietly(id, &bytes);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an asset; returns whether it existed on disk.
    pub async fn remove(&self, id: &str) -> PluginResult<bool> {
        validate_id(id)?;
        self.cache.invalidate(id);

        match tokio::fs::remove_file(self.root.join(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // Assets too large for the cache are still served from disk.
    fn cache_quietly(&self, id: &str, bytes: &[u8]) {
        if let Err(e) = self.cache.put(id, bytes) {
            tracing::debug!(asset = %id, error = %e, "Asset not cached");
        }
    }
}

fn validate_id(id: &str) -> PluginResult<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains("..")
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(PluginError::Cache(CacheError::InvalidAssetId(id.to_string())))
    }
}
