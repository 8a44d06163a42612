//! Protocol engine error types

use super::state::{Role, State};
use crate::core_envelope::EnvelopeError;
use crate::core_mediation::RoutingError;
use crate::core_outbound::OutboundError;
use crate::core_wallet::WalletError;
use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No table entry for the record's state, role and the message
    #[error("Invalid transition: {message} from {state} as {role}")]
    InvalidTransition { state: State, message: String, role: Role },

    /// The thread has reached a terminal state
    #[error("Stale message for finished thread {thread_id} ({state})")]
    Stale { thread_id: String, state: State },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A message arrived on a thread owned by another connection
    #[error("Thread {thread_id} belongs to connection {expected}, not {actual}")]
    ConnectionMismatch { thread_id: String, expected: String, actual: String },

    /// The record lacks what the operation needs, e.g. a peer endpoint
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Routing(RoutingError),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        ProtocolError::Malformed(message.into())
    }

    /// Code carried in problem reports sent back to the peer
    pub fn problem_code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidTransition { .. } => "invalid-transition",
            ProtocolError::Stale { .. } => "stale-thread",
            ProtocolError::RecordNotFound(_) => "thread-not-found",
            ProtocolError::UnknownMessageType(_) => "unknown-message-type",
            ProtocolError::Malformed(_) => "malformed-message",
            ProtocolError::ConnectionMismatch { .. } => "connection-mismatch",
            ProtocolError::NotReady(_) => "not-ready",
            ProtocolError::Routing(RoutingError::RouteConflict { .. }) => "route-conflict",
            ProtocolError::Routing(RoutingError::NotFound(_)) => "unknown-recipient",
            ProtocolError::Routing(RoutingError::Wallet(_))
            | ProtocolError::Wallet(_)
            | ProtocolError::Envelope(_)
            | ProtocolError::Outbound(_) => "internal-error",
        }
    }
}

impl From<RoutingError> for ProtocolError {
    fn from(e: RoutingError) -> Self {
        match e {
            RoutingError::Wallet(inner) => ProtocolError::Wallet(inner),
            other => ProtocolError::Routing(other),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
