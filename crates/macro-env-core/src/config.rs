//! Process-level configuration, fixed at startup.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Wire codec settings. Must match on the holder and every client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Obfuscate payloads with the shared secret.
    pub obfuscate: bool,
    /// Pre-shared secret.
    pub secret: String,
    /// Accept single-quoted JSON.
    pub normalize_quotes: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            obfuscate: false,
            secret: "secret".to_string(),
            normalize_quotes: true,
        }
    }
}

/// Environment holder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolderConfig {
    /// Persist the store after every change and reload it at startup.
    pub durable: bool,
    /// Variables the store starts with when nothing is persisted.
    pub defaults: Map<String, Value>,
    /// Log every raw bus message.
    pub trace_messages: bool,
    pub codec: CodecConfig,
}

impl Default for HolderConfig {
    fn default() -> Self {
        let mut defaults = Map::new();
        defaults.insert("DEVICE_SECRET".to_string(), json!(1234));
        Self {
            durable: false,
            defaults,
            trace_messages: false,
            codec: CodecConfig::default(),
        }
    }
}

/// Client engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a `get` waits for the holder, in milliseconds.
    pub reply_timeout_ms: u64,
    /// Liveness probes attempted at startup.
    pub liveness_retries: u32,
    /// Backoff unit between probes, in milliseconds.
    pub retry_base_delay_ms: u64,
    pub codec: CodecConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 500,
            liveness_retries: 4,
            retry_base_delay_ms: 500,
            codec: CodecConfig::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Delay taken after failed probe number `attempt` (0-based): `attempt² × base`.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(attempt).saturating_mul(u64::from(attempt));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

/// Whole-deployment configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub holder: HolderConfig,
    pub client: ClientConfig,
}

impl EnvConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    /// Returns error if the document is not valid configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnvConfig::default();
        assert!(!config.holder.durable);
        assert_eq!(config.holder.defaults.get("DEVICE_SECRET"), Some(&json!(1234)));
        assert_eq!(config.client.reply_timeout(), Duration::from_millis(500));
        assert_eq!(config.client.liveness_retries, 4);
    }

    #[test]
    fn test_partial_document() {
        let config = EnvConfig::from_json_str(
            r#"{
                "holder": { "durable": true, "defaults": { "TEAMS_SPACE": "room" } },
                "client": { "reply_timeout_ms": 250, "codec": { "obfuscate": true } }
            }"#,
        )
        .unwrap();

        assert!(config.holder.durable);
        assert_eq!(config.holder.defaults.len(), 1);
        assert_eq!(config.client.reply_timeout(), Duration::from_millis(250));
        assert!(config.client.codec.obfuscate);
        assert_eq!(config.client.codec.secret, "secret");
        assert_eq!(config.client.retry_base_delay_ms, 500);
    }

    #[test]
    fn test_retry_delay_is_quadratic() {
        let config = ClientConfig::default();
        let delays: Vec<_> = (0..4).map(|i| config.retry_delay(i).as_millis()).collect();
        assert_eq!(delays, vec![0, 500, 2000, 4500]);
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            EnvConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EnvConfig::from_file("/nonexistent/macro-env.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
