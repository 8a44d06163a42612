//! Test utilities
//!
//! Recording and loopback transports, a failing storage backend, event
//! helpers and agent fixtures shared by unit and integration tests.

pub mod async_helpers;
pub mod fixtures;
pub mod storage;
pub mod transports;

pub use async_helpers::*;
pub use fixtures::*;
pub use storage::*;
pub use transports::*;
