//! Durable key/value backends
//!
//! Both backends implement [`KeyValueStore`] and store `serde_json::Value`s
//! under the versioned keys built by [`crate::host::store_key`].
//!
//! - [`SledStore`] -- embedded `sled` database, flushed after every write
//! - [`keyring::KeyringStore`] -- one OS keyring entry per key
//!
//! [`open`] picks the backend named in the configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use sled::Db;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{LightwaveError, Result};
use crate::host::memory::MemoryStore;
use crate::host::KeyValueStore;

pub mod keyring;

pub use self::keyring::KeyringStore;

/// Key/value store backed by an embedded `sled` database.
///
/// # Examples
///
/// ```
/// use lightwave_smart::storage::SledStore;
///
/// # fn main() -> lightwave_smart::error::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let store = SledStore::open(dir.path().join("store"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::Storage`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| LightwaveError::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }

    /// Keys currently stored, in byte order.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.db
            .iter()
            .keys()
            .map(|key| {
                let key = key.map_err(|e| {
                    LightwaveError::Storage(format!("Failed to iterate keys: {}", e))
                })?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for SledStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let Some(bytes) = self
            .db
            .get(key.as_bytes())
            .map_err(|e| LightwaveError::Storage(format!("Failed to read {}: {}", key, e)))?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| LightwaveError::Storage(format!("Failed to write {}: {}", key, e)))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| LightwaveError::Storage(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(|e| LightwaveError::Storage(format!("Failed to remove {}: {}", key, e)))?;
        if removed.is_some() {
            self.db
                .flush_async()
                .await
                .map_err(|e| LightwaveError::Storage(format!("Failed to flush: {}", e)))?;
        }
        Ok(())
    }
}

/// Default location of the sled database under the platform data directory.
///
/// # Errors
///
/// Returns [`LightwaveError::Storage`] when the platform has no home
/// directory.
pub fn default_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "lightwave", "lightwave-smart").ok_or_else(|| {
        LightwaveError::Storage("Could not determine data directory".to_string())
    })?;
    Ok(dirs.data_dir().join("store"))
}

/// Opens the backend selected by `config`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.backend {
        StorageBackend::Sled => {
            let path = match &config.path {
                Some(path) => path.clone(),
                None => default_path()?,
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::debug!("Opening sled store at {}", path.display());
            Ok(Arc::new(SledStore::open(path)?))
        }
        StorageBackend::Keyring => Ok(Arc::new(KeyringStore::new())),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; nothing will survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
