//! Mediation records

use super::messages::MediateGrantBody;
use crate::core_protocol::{
    Effect, ErrorInfo, ProtocolDefinition, ProtocolRecord, ProtocolResult, RecordSeed, Role, State, Step,
    COORDINATE_MEDIATION,
};
use crate::core_wallet::{current_timestamp_ms, Tags};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MEDIATION_RECORD: &str = "mediation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediationRecord {
    pub mediation_id: String,
    pub thread_id: String,
    pub connection_id: String,
    pub role: Role,
    pub state: State,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MediationRecord {
    pub fn is_granted(&self) -> bool {
        self.state == State::Granted
    }
}

impl ProtocolRecord for MediationRecord {
    const RECORD_TYPE: &'static str = MEDIATION_RECORD;

    fn definition() -> &'static ProtocolDefinition {
        &COORDINATE_MEDIATION
    }

    fn start(thread_id: &str, role: Role, seed: RecordSeed) -> Self {
        let now = current_timestamp_ms();
        Self {
            mediation_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            connection_id: seed.connection_id.unwrap_or_default(),
            role,
            state: State::Start,
            routing_keys: Vec::new(),
            endpoint: None,
            is_default: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn id(&self) -> &str {
        &self.mediation_id
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
        Some(&self.connection_id).filter(|c| !c.is_empty()).map(String::as_str)
    }

    fn set_state(&mut self, state: State, updated_at: i64) {
        self.state = state;
        self.updated_at = updated_at;
    }

    fn set_error(&mut self, error: ErrorInfo) {
        self.error = Some(error);
    }

    fn apply_effect(&mut self, effect: Effect, step: &Step) -> ProtocolResult<()> {
        if effect == Effect::RecordGrant {
            let grant: MediateGrantBody = step.message.body_as()?;
            self.routing_keys = grant.routing_keys;
            self.endpoint = Some(grant.endpoint);
        }
        Ok(())
    }

    fn extra_tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("is_default".to_string(), self.is_default.to_string());
        tags
    }
}
