//! Authoritative environment store.

use std::sync::Arc;

use macro_env_core::{EnvStorage, PING, PONG, StorageError};
use serde_json::{Map, Value};
use thiserror::Error;

/// Attempted mutation of the liveness key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("variable \"{0}\" is managed by the holder and cannot be set")]
pub struct ReservedKeyError(pub String);

/// Why a persisted environment could not be used.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no persisted environment")]
    Absent,
    #[error("persisted environment unreadable: {0}")]
    Unreadable(StorageError),
    #[error("persisted environment is corrupt: {0}")]
    Corrupt(String),
}

/// Failure to write the environment out.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cannot serialize environment: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage full: {size} bytes over a limit of {limit}")]
    CapacityExceeded { size: usize, limit: usize },
    #[error("write failed: {0}")]
    Write(StorageError),
}

impl From<StorageError> for PersistenceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::CapacityExceeded { size, limit } => Self::CapacityExceeded { size, limit },
            other => Self::Write(other),
        }
    }
}

/// Persistence mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Memory only; lost on restart.
    Volatile,
    /// Saved after every change and reloaded at startup.
    Durable,
}

/// The holder's key/value map.
///
/// Always contains `PING = "PONG"`, which nothing outside this type can change.
pub struct EnvironmentStore {
    vars: Map<String, Value>,
    storage: Option<Arc<dyn EnvStorage>>,
}

impl std::fmt::Debug for EnvironmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentStore")
            .field("vars", &self.vars)
            .field("mode", &self.mode())
            .finish()
    }
}

impl EnvironmentStore {
    /// Volatile store seeded with `defaults`.
    #[must_use]
    pub fn volatile(defaults: Map<String, Value>) -> Self {
        Self {
            vars: with_liveness(defaults),
            storage: None,
        }
    }

    /// Build the store a holder starts with.
    ///
    /// Without storage the store is volatile. With storage, the persisted
    /// document is used when it loads cleanly; otherwise the defaults are
    /// saved as the new document. If that first save fails the store keeps
    /// running in volatile mode.
    pub async fn bootstrap(
        defaults: Map<String, Value>,
        storage: Option<Arc<dyn EnvStorage>>,
    ) -> Self {
        let Some(storage) = storage else {
            tracing::info!("starting in volatile mode: environment variables are not persisted");
            let store = Self::volatile(defaults);
            tracing::debug!(vars = ?store.vars, "environment ready");
            return store;
        };

        tracing::info!("starting in durable mode: environment variables are persisted");
        match Self::load(storage.as_ref()).await {
            Ok(vars) => {
                let store = Self {
                    vars: with_liveness(vars),
                    storage: Some(storage),
                };
                tracing::debug!(vars = ?store.vars, "environment loaded");
                return store;
            }
            Err(LoadError::Absent) => tracing::info!("no existing environment, creating default"),
            Err(e) => tracing::warn!("{e}, recreating default environment"),
        }

        let mut store = Self {
            vars: with_liveness(defaults),
            storage: Some(storage),
        };
        if let Err(e) = store.save().await {
            tracing::error!("cannot persist default environment: {e}");
            tracing::info!("changing to volatile mode");
            store.storage = None;
        }
        tracing::debug!(vars = ?store.vars, "environment ready");
        store
    }

    /// Read and validate the persisted document.
    ///
    /// # Errors
    /// Returns error if nothing usable is stored.
    pub async fn load(storage: &dyn EnvStorage) -> Result<Map<String, Value>, LoadError> {
        let contents = storage.load().await.map_err(|e| match e {
            StorageError::NotFound => LoadError::Absent,
            other => LoadError::Unreadable(other),
        })?;

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(vars)) if vars.contains_key(PING) => Ok(vars),
            Ok(Value::Object(_)) => Err(LoadError::Corrupt(format!("missing {PING} entry"))),
            Ok(_) => Err(LoadError::Corrupt("not a JSON object".to_string())),
            Err(e) => Err(LoadError::Corrupt(e.to_string())),
        }
    }

    /// Write the whole store out. A no-op in volatile mode.
    ///
    /// # Errors
    /// Returns error if serialization or the storage write fails.
    pub async fn save(&self) -> Result<(), PersistenceError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let contents = serde_json::to_string(&self.vars)?;
        storage.save(&contents).await?;
        Ok(())
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        if self.storage.is_some() {
            Mode::Durable
        } else {
            Mode::Volatile
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Bind `name` to `value`, returning the previous value.
    ///
    /// # Errors
    /// Returns error if `name` is the liveness key.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, ReservedKeyError> {
        let name = reserved_check(name.into())?;
        Ok(self.vars.insert(name, value))
    }

    /// Remove `name`, returning its value.
    ///
    /// # Errors
    /// Returns error if `name` is the liveness key.
    pub fn unset(&mut self, name: &str) -> Result<Option<Value>, ReservedKeyError> {
        let name = reserved_check(name.to_string())?;
        Ok(self.vars.remove(&name))
    }

    #[must_use]
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn with_liveness(mut vars: Map<String, Value>) -> Map<String, Value> {
    vars.insert(PING.to_string(), Value::String(PONG.to_string()));
    vars
}

fn reserved_check(name: String) -> Result<String, ReservedKeyError> {
    if name == PING {
        Err(ReservedKeyError(name))
    } else {
        Ok(name)
    }
}
