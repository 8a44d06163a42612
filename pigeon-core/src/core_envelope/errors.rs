//! Envelope error types

use thiserror::Error;

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Packing failed; nothing was produced
    #[error("Encode error: {0}")]
    Encode(String),

    /// Input is not a well-formed envelope, or no held key can open it
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}
