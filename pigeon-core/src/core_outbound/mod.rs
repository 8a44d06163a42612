//! Outbound delivery
//!
//! Per-destination FIFO lanes with bounded exponential backoff over an
//! [`OutboundTransport`] supplied by the embedding application.

pub mod errors;
pub mod queue;
pub mod responder;
pub mod transport;

pub use errors::{OutboundError, OutboundResult, TransportError};
pub use queue::{DeliveryTarget, OutboundMessage, OutboundQueue, RetryPolicy};
pub use responder::Responder;
pub use transport::OutboundTransport;
