//! Logging errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoggingError {
    /// `try_init` refused, usually because a subscriber is already set
    #[error("cannot install log subscriber: {0}")]
    SubscriberInstall(String),

    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
}
