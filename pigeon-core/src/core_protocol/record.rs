//! Records driven by the engine

use super::definition::{Effect, ProtocolDefinition};
use super::errors::ProtocolResult;
use super::message::{AgentMessage, ErrorInfo};
use super::state::{Direction, Role, State};
use crate::core_wallet::{Profile, StorageRecord, TagFilter, Tags, WalletError, WriteOp};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// What a new record is created with when a thread starts
#[derive(Debug, Clone, Default)]
pub struct RecordSeed {
    pub connection_id: Option<String>,
    pub parent_thread_id: Option<String>,
}

impl RecordSeed {
    pub fn for_connection(connection_id: impl Into<String>) -> Self {
        Self { connection_id: Some(connection_id.into()), parent_thread_id: None }
    }
}

/// A message being applied to a record
#[derive(Debug)]
pub struct Step {
    pub message: AgentMessage,
    /// Internal message name, e.g. `request-credential`
    pub name: &'static str,
    pub direction: Direction,
    /// Authcrypt sender of a received message
    pub sender_key: Option<String>,
    /// Local key a received message was unpacked with
    pub recipient_key: Option<String>,
    /// Writes committed in the same batch as the record
    pub staged: Vec<WriteOp>,
    /// Keys to make routable once the batch has committed
    pub new_keys: Vec<String>,
}

impl Step {
    pub fn sent(message: AgentMessage, name: &'static str) -> Self {
        Self {
            message,
            name,
            direction: Direction::Sent,
            sender_key: None,
            recipient_key: None,
            staged: Vec::new(),
            new_keys: Vec::new(),
        }
    }

    pub fn received(inbound: &super::InboundMessage) -> Self {
        Self {
            message: inbound.message.clone(),
            name: inbound.msg_type.name,
            direction: Direction::Received,
            sender_key: inbound.sender_key.clone(),
            recipient_key: Some(inbound.recipient_key.clone()),
            staged: Vec::new(),
            new_keys: Vec::new(),
        }
    }

    pub fn stage(mut self, op: WriteOp) -> Self {
        self.staged.push(op);
        self
    }

    pub fn with_new_key(mut self, verkey: impl Into<String>) -> Self {
        self.new_keys.push(verkey.into());
        self
    }
}

pub trait ProtocolRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const RECORD_TYPE: &'static str;

    fn definition() -> &'static ProtocolDefinition;

    /// Fresh record in the initial state
    fn start(thread_id: &str, role: Role, seed: RecordSeed) -> Self;

    fn id(&self) -> &str;
    fn thread_id(&self) -> &str;
    fn state(&self) -> State;
    fn role(&self) -> Role;
    fn connection_id(&self) -> Option<&str>;

    fn set_state(&mut self, state: State, updated_at: i64);
    fn set_error(&mut self, error: ErrorInfo);

    fn apply_effect(&mut self, effect: Effect, step: &Step) -> ProtocolResult<()> {
        let _ = (effect, step);
        Ok(())
    }

    fn extra_tags(&self) -> Tags {
        Tags::new()
    }

    fn to_storage(&self) -> ProtocolResult<StorageRecord> {
        let mut record = StorageRecord::from_value(Self::RECORD_TYPE, self.id(), self)?
            .with_tag("thread_id", self.thread_id())
            .with_tag("state", self.state().as_str())
            .with_tag("role", self.role().as_str())
            .with_tags(self.extra_tags());
        if let Some(connection_id) = self.connection_id() {
            record = record.with_tag("connection_id", connection_id);
        }
        Ok(record)
    }

    fn from_storage(record: &StorageRecord) -> ProtocolResult<Self> {
        Ok(record.value_as()?)
    }
}

pub async fn load<R: ProtocolRecord>(profile: &Profile, id: &str) -> ProtocolResult<R> {
    match profile.get(R::RECORD_TYPE, id).await {
        Ok(record) => R::from_storage(&record),
        Err(WalletError::NotFound(_)) => {
            Err(super::ProtocolError::RecordNotFound(format!("{} {}", R::RECORD_TYPE, id)))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn find_by_thread<R: ProtocolRecord>(profile: &Profile, thread_id: &str) -> ProtocolResult<Option<R>> {
    match profile.find_one(R::RECORD_TYPE, TagFilter::eq("thread_id", thread_id)).await? {
        Some(record) => Ok(Some(R::from_storage(&record)?)),
        None => Ok(None),
    }
}

pub async fn find_records<R: ProtocolRecord>(profile: &Profile, filter: TagFilter) -> ProtocolResult<Vec<R>> {
    profile
        .find_all(R::RECORD_TYPE, filter)
        .await?
        .iter()
        .map(R::from_storage)
        .collect()
}
