//! Core abstractions for the shared macro environment.
//!
//! This crate provides the pieces both sides of the protocol agree on:
//! - `Envelope` / `Operation` - the protocol message unit
//! - `WireCodec` - text encoding with optional obfuscation
//! - `Transport` - broadcast bus abstraction, plus the in-process `LocalBus`
//! - `EnvStorage` - persistent storage collaborator trait
//! - Configuration structs shared by holder and clients

pub mod bus;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod traits;

pub use bus::LocalBus;
pub use codec::{DecodeError, EncodeError, Obfuscator, WireCodec, XorHexCipher};
pub use config::{ClientConfig, CodecConfig, ConfigError, EnvConfig, HolderConfig};
pub use envelope::{Envelope, Operation};
pub use traits::{EnvStorage, StorageError, Subscription, Transport, TransportError};

/// Reserved liveness key.
pub const PING: &str = "PING";

/// Value permanently bound to [`PING`].
pub const PONG: &str = "PONG";
