//! Environment holder for the shared macro environment.
//!
//! Provides:
//! - `EnvironmentStore` - authoritative key/value map with durable/volatile modes
//! - `HolderHandler` - stateless responder to get/set envelopes
//! - `Holder` - message loop wiring the handler to a transport
//! - Storage implementations (memory, macro file)

pub mod handler;
pub mod holder;
pub mod storage;
pub mod store;

pub use handler::{Disposition, HolderHandler, IgnoreReason};
pub use holder::{Holder, HolderHandle};
pub use store::{EnvironmentStore, LoadError, Mode, PersistenceError, ReservedKeyError};
