//! Mediation and routing
//!
//! Negotiates mediation through the protocol engine, keeps the mediator's
//! keylist and relays `forward` payloads without decrypting them.

pub mod coordinator;
pub mod errors;
pub mod forward;
pub mod mediation;
pub mod messages;
pub mod routes;

pub use coordinator::{ForwardOutcome, MediationManager, MediationRouting};
pub use errors::{RoutingError, RoutingResult};
pub use mediation::{MediationRecord, MEDIATION_RECORD};
pub use messages::{
    ForwardMessage, KeylistAction, KeylistResult, KeylistUpdateItem, KeylistUpdateResponseBody, KeylistUpdated,
    MediateGrantBody,
};
pub use routes::{RouteRecord, Routes, ROUTE_RECORD};
