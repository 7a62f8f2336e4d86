//! Wire codec: envelope <-> bus text, with optional obfuscation.

use std::{borrow::Cow, sync::Arc};

use thiserror::Error;

use crate::{CodecConfig, Envelope};

/// Reasons a bus message is not a protocol message.
///
/// These are never fatal: the bus is shared with people and other tools,
/// so callers drop the message and move on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is not a hex sequence")]
    NotHex,
    #[error("revealed payload is not UTF-8")]
    NotUtf8,
    #[error("not an envelope: {0}")]
    NotAnEnvelope(String),
}

/// Envelope serialization error.
#[derive(Debug, Error)]
#[error("cannot serialize envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Reversible text transform applied on top of the JSON payload.
///
/// Implementations must be symmetric: `reveal(obfuscate(s)) == s` for the
/// same instance. Swap in an authenticated cipher here if real secrecy is
/// ever needed.
pub trait Obfuscator: Send + Sync {
    /// Transform plaintext into its wire form.
    fn obfuscate(&self, plain: &str) -> String;

    /// Restore plaintext from its wire form.
    ///
    /// # Errors
    /// Returns error if the payload was not produced by a compatible transform.
    fn reveal(&self, payload: &str) -> Result<String, DecodeError>;
}

/// Toy XOR cipher rendered as two-digit hex.
///
/// Each UTF-8 byte is XORed with the secret's bytes, cycled, and written as
/// a fixed-width lowercase hex pair. Obfuscation only, not confidentiality.
#[derive(Debug, Clone)]
pub struct XorHexCipher {
    key: Vec<u8>,
}

impl XorHexCipher {
    /// Create a cipher from a pre-shared secret.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn apply(&self, bytes: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        for (byte, k) in bytes.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= k;
        }
    }
}

impl Obfuscator for XorHexCipher {
    fn obfuscate(&self, plain: &str) -> String {
        let mut bytes = plain.as_bytes().to_vec();
        self.apply(&mut bytes);
        hex::encode(bytes)
    }

    fn reveal(&self, payload: &str) -> Result<String, DecodeError> {
        let mut bytes = hex::decode(payload.trim()).map_err(|_| DecodeError::NotHex)?;
        self.apply(&mut bytes);
        String::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)
    }
}

/// Encodes envelopes to bus text and back.
#[derive(Clone, Default)]
pub struct WireCodec {
    obfuscator: Option<Arc<dyn Obfuscator>>,
    normalize_quotes: bool,
}

impl std::fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCodec")
            .field("obfuscated", &self.is_obfuscated())
            .field("normalize_quotes", &self.normalize_quotes)
            .finish()
    }
}

impl WireCodec {
    /// Plain JSON codec.
    #[must_use]
    pub fn plain() -> Self {
        Self::default()
    }

    /// Codec applying `obfuscator` on top of JSON.
    #[must_use]
    pub fn obfuscated(obfuscator: impl Obfuscator + 'static) -> Self {
        Self {
            obfuscator: Some(Arc::new(obfuscator)),
            normalize_quotes: false,
        }
    }

    /// Build the codec described by `config`.
    #[must_use]
    pub fn from_config(config: &CodecConfig) -> Self {
        let codec = if config.obfuscate {
            Self::obfuscated(XorHexCipher::new(&config.secret))
        } else {
            Self::plain()
        };
        codec.with_quote_normalization(config.normalize_quotes)
    }

    /// Accept single-quoted JSON as sent by some cloud-side callers.
    #[must_use]
    pub fn with_quote_normalization(mut self, enabled: bool) -> Self {
        self.normalize_quotes = enabled;
        self
    }

    /// Whether an obfuscation layer is active.
    #[must_use]
    pub fn is_obfuscated(&self) -> bool {
        self.obfuscator.is_some()
    }

    /// Encode an envelope to its wire text.
    ///
    /// # Errors
    /// Returns error if the envelope cannot be serialized.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, EncodeError> {
        let json = serde_json::to_string(envelope)?;
        Ok(match &self.obfuscator {
            Some(obfuscator) => obfuscator.obfuscate(&json),
            None => json,
        })
    }

    /// Decode wire text to an envelope.
    ///
    /// # Errors
    /// Returns error if the text is not a protocol message.
    pub fn decode(&self, text: &str) -> Result<Envelope, DecodeError> {
        let plain: Cow<'_, str> = match &self.obfuscator {
            Some(obfuscator) => Cow::Owned(obfuscator.reveal(text)?),
            None => Cow::Borrowed(text),
        };

        match serde_json::from_str(&plain) {
            Ok(envelope) => Ok(envelope),
            Err(e) if self.normalize_quotes && plain.contains('\'') => {
                serde_json::from_str(&plain.replace('\'', "\""))
                    .map_err(|_| DecodeError::NotAnEnvelope(e.to_string()))
            }
            Err(e) => Err(DecodeError::NotAnEnvelope(e.to_string())),
        }
    }

    /// Decode, logging and swallowing anything that is not ours.
    #[must_use]
    pub fn decode_or_skip(&self, text: &str) -> Option<Envelope> {
        match self.decode(text) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring bus message: {text}");
                if self.is_obfuscated() {
                    tracing::warn!(
                        "undecodable bus message: check the shared secret matches on every macro"
                    );
                }
                None
            }
        }
    }
}
