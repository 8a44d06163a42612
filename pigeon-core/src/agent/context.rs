//! Shared handles passed to every manager

use crate::config::AgentConfig;
use crate::core_outbound::{OutboundQueue, Responder};
use crate::core_protocol::{Engine, MessageTypeRegistry};
use crate::core_wallet::{Profile, TenantManager};
use crate::events::EventBroadcaster;
use std::sync::Arc;

pub struct AgentContext {
    pub config: AgentConfig,
    pub tenants: Arc<TenantManager>,
    pub engine: Engine,
    pub outbound: OutboundQueue,
    pub events: EventBroadcaster,
    pub types: MessageTypeRegistry,
}

impl AgentContext {
    pub fn responder(&self) -> Responder<'_> {
        Responder::new(&self.outbound, &self.types)
    }

    /// Label advertised by `profile`, falling back to the agent label
    pub fn label_for(&self, profile: &Profile) -> String {
        profile.settings().label.clone().unwrap_or_else(|| self.config.label.clone())
    }

    pub async fn base_profile(&self) -> crate::core_wallet::WalletResult<Profile> {
        self.tenants.open_profile(&self.config.base_tenant).await
    }
}
