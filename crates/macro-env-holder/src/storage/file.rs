//! Environment stored in an inactive macro file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use macro_env_core::{EnvStorage, StorageError};

/// Prefix that keeps the stored document a syntactically valid macro.
pub const MACRO_PREFIX: &str = "const json = ";

/// Storage writing the environment as `const json = {...}` to a file.
#[derive(Debug, Clone)]
pub struct MacroFileStorage {
    path: PathBuf,
    max_bytes: Option<usize>,
}

impl MacroFileStorage {
    /// Store the environment at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: None,
        }
    }

    /// Reject files larger than `max_bytes`.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EnvStorage for MacroFileStorage {
    async fn load(&self) -> Result<String, StorageError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound,
                _ => StorageError::Unavailable(e.to_string()),
            })?;

        Ok(raw
            .strip_prefix(MACRO_PREFIX)
            .map_or(raw.as_str(), str::trim_end)
            .to_string())
    }

    async fn save(&self, contents: &str) -> Result<(), StorageError> {
        let body = format!("{MACRO_PREFIX}{contents}");
        if let Some(limit) = self.max_bytes {
            if body.len() > limit {
                return Err(StorageError::CapacityExceeded {
                    size: body.len(),
                    limit,
                });
            }
        }

        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}
