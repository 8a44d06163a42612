//! Agent facade
//!
//! Wires the wallet, engine, outbound queue and dispatcher together and
//! hands out per-tenant managers.

mod context;

pub use context::AgentContext;

use crate::config::{Config, ConfigError};
use crate::core_dispatch::{DispatchOutcome, Dispatcher};
use crate::core_mediation::MediationManager;
use crate::core_outbound::{OutboundQueue, OutboundTransport};
use crate::core_protocol::{ConnectionManager, CredentialManager, Engine, MessageTypeRegistry, PresentationManager};
use crate::core_wallet::{Profile, ProfileSettings, TenantManager, WalletError, WalletResult};
use crate::events::{AgentEvent, EventBroadcaster};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// A running agent
#[derive(Clone)]
pub struct Agent {
    ctx: Arc<AgentContext>,
    dispatcher: Arc<Dispatcher>,
}

impl Agent {
    /// Open the configured wallet and start an agent delivering through `transport`
    pub async fn start(config: Config, transport: Arc<dyn OutboundTransport>) -> AgentResult<Self> {
        config.validate()?;
        let tenants = TenantManager::new(&config.wallet)?;
        Self::with_tenants(config, tenants, transport).await
    }

    /// Start over an already opened tenant manager
    pub async fn with_tenants(
        config: Config,
        tenants: TenantManager,
        transport: Arc<dyn OutboundTransport>,
    ) -> AgentResult<Self> {
        let events = EventBroadcaster::default();
        let outbound = OutboundQueue::new(transport, &config.outbound, events.clone());
        let ctx = Arc::new(AgentContext {
            config: config.agent.clone(),
            tenants: Arc::new(tenants),
            engine: Engine::new(events.clone()),
            outbound,
            events,
            types: MessageTypeRegistry::from_config(&config.dispatch),
        });

        let base_settings = ProfileSettings::unprotected().with_label(config.agent.label.clone());
        ctx.tenants.open_or_create(&config.agent.base_tenant, base_settings).await?;

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&ctx), &config.dispatch));
        info!(
            label = %config.agent.label,
            endpoint = %config.agent.endpoint,
            base_tenant = %config.agent.base_tenant,
            "agent started"
        );
        Ok(Self { ctx, dispatcher })
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn endpoint(&self) -> &str {
        &self.ctx.config.endpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.ctx.events.subscribe()
    }

    pub async fn base_profile(&self) -> WalletResult<Profile> {
        self.ctx.base_profile().await
    }

    pub async fn create_tenant(&self, tenant_id: &str, settings: ProfileSettings) -> WalletResult<Profile> {
        self.ctx.tenants.create_profile(tenant_id, settings).await
    }

    pub async fn open_tenant(&self, tenant_id: &str) -> WalletResult<Profile> {
        self.ctx.tenants.open_profile(tenant_id).await
    }

    /// Remove a tenant once its in-flight operations have drained
    pub async fn remove_tenant(&self, tenant_id: &str) -> WalletResult<()> {
        if tenant_id == self.ctx.config.base_tenant {
            return Err(WalletError::InvalidInput("the base tenant cannot be removed".to_string()));
        }
        let profile = self.ctx.tenants.open_profile(tenant_id).await?;
        self.ctx.tenants.remove_profile(&profile).await
    }

    pub async fn list_tenants(&self) -> WalletResult<Vec<String>> {
        self.ctx.tenants.list_tenants().await
    }

    pub fn connections<'a>(&'a self, profile: &'a Profile) -> ConnectionManager<'a> {
        ConnectionManager::new(&self.ctx, profile)
    }

    pub fn credentials<'a>(&'a self, profile: &'a Profile) -> CredentialManager<'a> {
        CredentialManager::new(&self.ctx, profile)
    }

    pub fn presentations<'a>(&'a self, profile: &'a Profile) -> PresentationManager<'a> {
        PresentationManager::new(&self.ctx, profile)
    }

    pub fn mediation<'a>(&'a self, profile: &'a Profile) -> MediationManager<'a> {
        MediationManager::new(&self.ctx, profile)
    }

    /// Fire-and-forget processing of an inbound envelope
    pub fn handle_inbound(&self, bytes: Vec<u8>) -> JoinHandle<DispatchOutcome> {
        self.dispatcher.handle_inbound(bytes)
    }

    pub async fn process_inbound(&self, bytes: &[u8]) -> DispatchOutcome {
        self.dispatcher.process_inbound(bytes).await
    }
}
