//! Exchange records shared by the credential and presentation protocols

use super::connections::ConnectionManager;
use super::definition::{Effect, ProtocolDefinition};
use super::errors::{ProtocolError, ProtocolResult};
use super::message::{AgentMessage, ErrorInfo, InboundMessage, ProblemReportBody};
use super::message_type::{ProtocolFamily, PROBLEM_REPORT};
use super::record::{find_by_thread, find_records, load, ProtocolRecord, RecordSeed, Step};
use super::state::{Role, State};
use crate::agent::AgentContext;
use crate::core_wallet::{current_timestamp_ms, Profile, TagFilter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

/// Binds an exchange record to one protocol
pub trait ExchangeKind: fmt::Debug + Clone + Send + Sync + 'static {
    const RECORD_TYPE: &'static str;
    const FAMILY: ProtocolFamily;

    fn definition() -> &'static ProtocolDefinition;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ExchangeRecord<K: ExchangeKind> {
    pub exchange_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub parent_thread_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    pub role: Role,
    pub state: State,
    /// Message bodies by step name (`proposal`, `offer`, ...)
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Outcome of checking a received presentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip)]
    kind: PhantomData<K>,
}

impl<K: ExchangeKind> ExchangeRecord<K> {
    pub fn protocol(&self) -> &'static str {
        K::FAMILY.protocol()
    }

    pub fn payload(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl<K: ExchangeKind> ProtocolRecord for ExchangeRecord<K> {
    const RECORD_TYPE: &'static str = K::RECORD_TYPE;

    fn definition() -> &'static ProtocolDefinition {
        K::definition()
    }

    fn start(thread_id: &str, role: Role, seed: RecordSeed) -> Self {
        let now = current_timestamp_ms();
        Self {
            exchange_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            parent_thread_id: seed.parent_thread_id,
            connection_id: seed.connection_id,
            role,
            state: State::Start,
            payload: Map::new(),
            verified: None,
            error: None,
            created_at: now,
            updated_at: now,
            kind: PhantomData,
        }
    }

    fn id(&self) -> &str {
        &self.exchange_id
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn state(&self) -> State {
        self.state
    }

    fn role(&self) -> Role {
        self.role
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    fn set_state(&mut self, state: State, updated_at: i64) {
        self.state = state;
        self.updated_at = updated_at;
    }

    fn set_error(&mut self, error: ErrorInfo) {
        self.error = Some(error);
    }

    fn apply_effect(&mut self, effect: Effect, step: &Step) -> ProtocolResult<()> {
        match effect {
            Effect::Store(key) => {
                self.payload.insert(key.to_string(), step.message.body.clone());
            }
            Effect::VerifyPresentation => {
                let verified =
                    super::present_proof::verify_presentation(self.payload.get("request"), &step.message.body);
                self.payload.insert("presentation".to_string(), step.message.body.clone());
                self.verified = Some(verified);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Operations on one kind of exchange within a profile
pub struct ExchangeManager<'a, K: ExchangeKind> {
    ctx: &'a AgentContext,
    profile: &'a Profile,
    kind: PhantomData<K>,
}

impl<'a, K: ExchangeKind> ExchangeManager<'a, K> {
    pub fn new(ctx: &'a AgentContext, profile: &'a Profile) -> Self {
        Self { ctx, profile, kind: PhantomData }
    }

    fn connections(&self) -> ConnectionManager<'a> {
        ConnectionManager::new(self.ctx, self.profile)
    }

    fn uri(&self, name: &'static str) -> String {
        self.ctx.types.uri(K::FAMILY, name)
    }

    /// Open a new thread on a completed connection by sending `name`
    pub async fn start(&self, connection_id: &str, name: &'static str, body: Value) -> ProtocolResult<ExchangeRecord<K>> {
        let connection = self.connections().active(connection_id).await?;
        let message = AgentMessage::new(self.uri(name), body);
        let thread_id = message.thread_id().to_string();

        let record = self
            .ctx
            .engine
            .advance(
                self.profile,
                &thread_id,
                Step::sent(message.clone(), name),
                RecordSeed::for_connection(connection_id),
                |_| Ok(()),
            )
            .await?;
        self.connections().send_on(&connection, &message).await?;
        Ok(record)
    }

    /// Continue an exchange by sending `name` on its thread
    pub async fn send(&self, exchange_id: &str, name: &'static str, body: Value) -> ProtocolResult<ExchangeRecord<K>> {
        let record: ExchangeRecord<K> = load(self.profile, exchange_id).await?;
        let connection_id = record
            .connection_id
            .clone()
            .ok_or_else(|| ProtocolError::NotReady(format!("exchange {} has no connection", exchange_id)))?;
        let connection = self.connections().active(&connection_id).await?;
        let message = AgentMessage::new(self.uri(name), body)
            .with_thread(record.thread_id.clone(), record.parent_thread_id.clone());

        let record = self
            .ctx
            .engine
            .advance(
                self.profile,
                &record.thread_id,
                Step::sent(message.clone(), name),
                RecordSeed::for_connection(&connection_id),
                |_| Ok(()),
            )
            .await?;
        self.connections().send_on(&connection, &message).await?;
        Ok(record)
    }

    /// Report a problem to the peer and abandon the exchange
    pub async fn abandon(
        &self,
        exchange_id: &str,
        code: &str,
        description: &str,
    ) -> ProtocolResult<ExchangeRecord<K>> {
        let body = serde_json::to_value(ProblemReportBody::new(code, description))?;
        self.send(exchange_id, PROBLEM_REPORT, body).await
    }

    pub async fn receive(&self, inbound: &InboundMessage) -> ProtocolResult<ExchangeRecord<K>> {
        let connection = inbound.require_connection()?;
        let seed = RecordSeed {
            connection_id: Some(connection.connection_id.clone()),
            parent_thread_id: inbound.message.parent_thread_id().map(str::to_string),
        };
        self.ctx
            .engine
            .advance(self.profile, inbound.thread_id(), Step::received(inbound), seed, |_| Ok(()))
            .await
    }

    pub async fn get(&self, exchange_id: &str) -> ProtocolResult<ExchangeRecord<K>> {
        load(self.profile, exchange_id).await
    }

    pub async fn find_by_thread(&self, thread_id: &str) -> ProtocolResult<Option<ExchangeRecord<K>>> {
        find_by_thread(self.profile, thread_id).await
    }

    pub async fn list(&self, connection_id: Option<&str>) -> ProtocolResult<Vec<ExchangeRecord<K>>> {
        let filter = match connection_id {
            Some(id) => TagFilter::eq("connection_id", id),
            None => TagFilter::All,
        };
        find_records(self.profile, filter).await
    }
}
