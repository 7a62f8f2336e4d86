//! In-memory environment storage.

use std::sync::RwLock;

use async_trait::async_trait;
use macro_env_core::{EnvStorage, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and single-process deployments. An optional size limit
/// mimics a storage quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: RwLock<Option<String>>,
    limit: RwLock<Option<usize>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage that already holds `contents`.
    #[must_use]
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: RwLock::new(Some(contents.into())),
            limit: RwLock::new(None),
        }
    }

    /// Create an empty storage rejecting documents over `limit` bytes.
    #[must_use]
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            contents: RwLock::new(None),
            limit: RwLock::new(Some(limit)),
        }
    }

    /// Change the size limit.
    pub fn set_capacity_limit(&self, limit: Option<usize>) {
        if let Ok(mut guard) = self.limit.write() {
            *guard = limit;
        }
    }

    /// Current document, if any.
    #[must_use]
    pub fn contents(&self) -> Option<String> {
        self.contents.read().ok().and_then(|c| c.clone())
    }
}

#[async_trait]
impl EnvStorage for MemoryStorage {
    async fn load(&self) -> Result<String, StorageError> {
        self.contents
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .clone()
            .ok_or(StorageError::NotFound)
    }

    async fn save(&self, contents: &str) -> Result<(), StorageError> {
        let limit = *self
            .limit
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        if let Some(limit) = limit {
            if contents.len() > limit {
                return Err(StorageError::CapacityExceeded {
                    size: contents.len(),
                    limit,
                });
            }
        }

        *self
            .contents
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))? = Some(contents.to_string());

        Ok(())
    }
}
