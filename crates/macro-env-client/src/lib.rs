//! Client side of the shared macro environment.
//!
//! Provides:
//! - `ClientEngine` - `get`/`set` over the bus with timeouts and correlation
//! - `Readiness` - outcome of the startup liveness loop

pub mod engine;
pub mod readiness;

pub use engine::{ClientEngine, ClientError, PendingRequest};
pub use readiness::Readiness;
