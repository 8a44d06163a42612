//! Routing error types

use crate::core_wallet::WalletError;
use thiserror::Error;

pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The key is already routed to another connection
    #[error("Route conflict: {key} is owned by connection {owner}")]
    RouteConflict { key: String, owner: String },

    #[error("No route for key {0}")]
    NotFound(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}
