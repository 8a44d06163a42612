use thiserror::Error;

pub type OutboundResult<T> = Result<T, OutboundError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboundError {
    #[error("Outbound queue is shut down")]
    Closed,

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

/// Failure reported by a transport for one send attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying, e.g. a timeout or refused connection
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// Retrying cannot help, e.g. an unsupported endpoint scheme
    #[error("Permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}
