//! Wallet error types

use thiserror::Error;

pub type WalletResult<T> = Result<T, WalletError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("Tenant already exists: {0}")]
    DuplicateTenant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Removal could not fence in-flight operations in time
    #[error("Profile busy: {0}")]
    ProfileBusy(String),

    /// The verkey already routes to another tenant
    #[error("Key {verkey} is owned by tenant {owner}")]
    KeyOwned { verkey: String, owner: String },

    #[error("Duplicate record: {record_type}/{id}")]
    DuplicateRecord { record_type: String, id: String },

    /// Backend failure; `transient` failures are retried once
    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    /// A record or query reached outside the owning tenant
    #[error("Scope violation: {0}")]
    ScopeViolation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl WalletError {
    pub fn storage(message: impl Into<String>) -> Self {
        WalletError::Storage { message: message.into(), transient: false }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        WalletError::Storage { message: message.into(), transient: true }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::Storage { transient: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WalletError::NotFound(_))
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::Serialization(e.to_string())
    }
}
