//! Dispatch error types

use crate::core_envelope::EnvelopeError;
use crate::core_mediation::RoutingError;
use crate::core_protocol::ProtocolError;
use crate::core_wallet::WalletError;
use crate::events::RejectionKind;
use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Duplicate message {0}")]
    Duplicate(String),

    /// None of the envelope's recipients is held or routed here
    #[error("No recipient key is held or routed: {0:?}")]
    NoRecipient(Vec<String>),

    #[error("Forward nesting deeper than {0}")]
    RelayDepth(usize),
}

impl DispatchError {
    pub fn kind(&self) -> RejectionKind {
        match self {
            DispatchError::Envelope(_) | DispatchError::NoRecipient(_) => RejectionKind::Parse,
            DispatchError::Wallet(e) => wallet_kind(e),
            DispatchError::UnknownMessageType(_) => RejectionKind::UnknownMessageType,
            DispatchError::Duplicate(_) => RejectionKind::Duplicate,
            DispatchError::RelayDepth(_) => RejectionKind::Routing,
            DispatchError::Protocol(e) => match e {
                ProtocolError::InvalidTransition { .. } | ProtocolError::ConnectionMismatch { .. } => {
                    RejectionKind::InvalidTransition
                }
                ProtocolError::Stale { .. } => RejectionKind::Stale,
                ProtocolError::RecordNotFound(_) | ProtocolError::NotReady(_) => RejectionKind::NotFound,
                ProtocolError::UnknownMessageType(_) => RejectionKind::UnknownMessageType,
                ProtocolError::Malformed(_) | ProtocolError::Envelope(_) => RejectionKind::Parse,
                ProtocolError::Routing(RoutingError::Wallet(w)) | ProtocolError::Wallet(w) => wallet_kind(w),
                ProtocolError::Routing(_) | ProtocolError::Outbound(_) => RejectionKind::Routing,
            },
        }
    }

    /// Failure of this agent's storage rather than of the message, so a
    /// redelivery may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Wallet(e)
            | DispatchError::Protocol(ProtocolError::Wallet(e))
            | DispatchError::Protocol(ProtocolError::Routing(RoutingError::Wallet(e))) => wallet_retryable(e),
            _ => false,
        }
    }

    /// Code for the problem report sent back to the peer
    pub fn problem_code(&self) -> &'static str {
        match self {
            DispatchError::Protocol(e) => e.problem_code(),
            DispatchError::UnknownMessageType(_) => "unknown-message-type",
            DispatchError::Envelope(_) | DispatchError::NoRecipient(_) => "malformed-message",
            DispatchError::Wallet(_) | DispatchError::Duplicate(_) | DispatchError::RelayDepth(_) => {
                "internal-error"
            }
        }
    }
}

fn wallet_retryable(error: &WalletError) -> bool {
    matches!(error, WalletError::Storage { .. } | WalletError::ProfileBusy(_))
}

fn wallet_kind(error: &WalletError) -> RejectionKind {
    if error.is_not_found() {
        RejectionKind::NotFound
    } else {
        RejectionKind::Storage
    }
}
