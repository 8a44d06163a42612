//! Inbound dispatch
//!
//! Turns raw envelopes into protocol steps for the tenant that holds the
//! recipient key, or relays them when this agent only mediates the key.

pub mod dispatcher;
pub mod errors;

pub use dispatcher::{DispatchOutcome, Dispatcher, MAX_RELAY_DEPTH};
pub use errors::{DispatchError, DispatchResult};
