//! Protocol state machines
//!
//! Every exchange protocol is a static transition table driven by one
//! generic [`Engine`]. Records are stored in the owning tenant's profile and
//! correlated by thread id.

pub mod connections;
pub mod definition;
pub mod didexchange;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod issue_credential;
pub mod message;
pub mod message_type;
pub mod present_proof;
pub mod record;
pub mod state;
pub mod thread_lock;

pub use connections::ConnectionManager;
pub use definition::{
    Effect, ProtocolDefinition, Transition, COORDINATE_MEDIATION, DID_EXCHANGE, ISSUE_CREDENTIAL, PRESENT_PROOF,
};
pub use didexchange::{did_from_verkey, ConnectionRecord, DidDoc, Invitation};
pub use engine::Engine;
pub use errors::{ProtocolError, ProtocolResult};
pub use exchange::{ExchangeKind, ExchangeManager, ExchangeRecord};
pub use issue_credential::{Credential, CredentialExchange, CredentialManager, CredentialPreview};
pub use message::{AgentMessage, ErrorInfo, InboundMessage, ProblemReportBody, ThreadDecorator};
pub use message_type::{MessageType, MessageTypeRegistry, ProtocolFamily, PROBLEM_REPORT};
pub use present_proof::{
    Presentation, PresentationBody, PresentationExchange, PresentationManager, PresentationRequest,
};
pub use record::{find_by_thread, find_records, load, ProtocolRecord, RecordSeed, Step};
pub use state::{Direction, Role, State};
pub use thread_lock::{ThreadLocks, ThreadToken};
