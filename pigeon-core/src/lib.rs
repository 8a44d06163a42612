//! Pigeon: a multi-tenant DIDComm agent runtime
//!
//! Envelopes come in through [`agent::Agent::handle_inbound`], are unpacked
//! for the tenant holding the recipient key and drive per-thread protocol
//! records (DID exchange, issue-credential, present-proof, mediation).
//! Replies leave through per-destination outbound lanes.

pub mod agent;
pub mod config;
pub mod core_dispatch;
pub mod core_envelope;
pub mod core_mediation;
pub mod core_outbound;
pub mod core_protocol;
pub mod core_wallet;
pub mod events;
pub mod logging;
pub mod test_utils;

pub use agent::{Agent, AgentError, AgentResult};
pub use config::Config;
pub use logging::{init_logging, LogLevel};
