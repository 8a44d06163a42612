//! Mediation and routing coordinator
//!
//! Requester side: ask a connection for mediation, keep the granted routing
//! keys, pick one default mediation and register new keys with it.
//! Mediator side: grant or deny requests, maintain the keylist and relay
//! `forward` messages without opening their payload.

use super::mediation::MediationRecord;
use super::messages::{
    ForwardMessage, KeylistBody, KeylistKey, KeylistUpdateBody, KeylistUpdateItem, KeylistUpdateResponseBody,
    MediateGrantBody,
};
use super::routes::Routes;
use crate::agent::AgentContext;
use crate::core_envelope::KeyPair;
use crate::core_protocol::{
    find_records, load, AgentMessage, ConnectionManager, InboundMessage, ProtocolError, ProtocolFamily,
    ProtocolRecord, ProtocolResult, RecordSeed, Role, State, Step, ThreadLocks, PROBLEM_REPORT,
};
use crate::core_wallet::{Profile, TagFilter, WriteOp};
use crate::events::{AgentEvent, RelayTarget};
use serde_json::json;
use tracing::{debug, info};

/// Endpoint and keys to advertise while a default mediation is in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediationRouting {
    pub mediation_id: String,
    pub endpoint: String,
    pub routing_keys: Vec<String>,
}

/// What happened to a forwarded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The recipient is a tenant of this agent; dispatch the payload again
    Local { tenant_id: String, payload: Vec<u8> },
    /// Queued unchanged for the connection that registered the key
    Queued { connection_id: String, message_id: String },
}

pub struct MediationManager<'a> {
    ctx: &'a AgentContext,
    profile: &'a Profile,
}

impl<'a> MediationManager<'a> {
    pub fn new(ctx: &'a AgentContext, profile: &'a Profile) -> Self {
        Self { ctx, profile }
    }

    pub fn routes(&self) -> Routes<'a> {
        Routes::new(self.profile)
    }

    fn connections(&self) -> ConnectionManager<'a> {
        ConnectionManager::new(self.ctx, self.profile)
    }

    fn uri(&self, name: &'static str) -> String {
        self.ctx.types.uri(ProtocolFamily::CoordinateMediation, name)
    }

    pub async fn get(&self, mediation_id: &str) -> ProtocolResult<MediationRecord> {
        load(self.profile, mediation_id).await
    }

    pub async fn list(&self) -> ProtocolResult<Vec<MediationRecord>> {
        find_records(self.profile, TagFilter::All).await
    }

    /// Ask the peer on `connection_id` to mediate for this profile
    pub async fn request_mediation(&self, connection_id: &str) -> ProtocolResult<MediationRecord> {
        let connection = self.connections().active(connection_id).await?;
        let message = AgentMessage::new(self.uri("mediate-request"), json!({}));
        let record: MediationRecord = self
            .ctx
            .engine
            .advance(
                self.profile,
                &message.id,
                Step::sent(message.clone(), "mediate-request"),
                RecordSeed::for_connection(connection_id),
                |_| Ok(()),
            )
            .await?;
        self.connections().send_on(&connection, &message).await?;
        info!(tenant = self.profile.tenant_id(), connection = connection_id, "mediation requested");
        Ok(record)
    }

    /// Grant a received request with a fresh routing key
    pub async fn grant(&self, mediation_id: &str) -> ProtocolResult<MediationRecord> {
        let record = self.get(mediation_id).await?;
        let routing_key = KeyPair::generate();
        let body = MediateGrantBody {
            endpoint: self.ctx.config.endpoint.clone(),
            routing_keys: vec![routing_key.verkey()],
        };
        let message = AgentMessage::new(self.uri("mediate-grant"), serde_json::to_value(body)?)
            .with_thread(record.thread_id.clone(), None);
        let step = Step::sent(message.clone(), "mediate-grant")
            .stage(self.profile.stage_key(&routing_key)?)
            .with_new_key(routing_key.verkey());

        let record: MediationRecord = self
            .ctx
            .engine
            .advance(self.profile, &record.thread_id, step, RecordSeed::for_connection(&record.connection_id), |_| Ok(()))
            .await?;
        self.connections().send_message(&record.connection_id, &message).await?;
        info!(tenant = self.profile.tenant_id(), mediation = mediation_id, "mediation granted");
        Ok(record)
    }

    pub async fn deny(&self, mediation_id: &str) -> ProtocolResult<MediationRecord> {
        let record = self.get(mediation_id).await?;
        let message =
            AgentMessage::new(self.uri("mediate-deny"), json!({})).with_thread(record.thread_id.clone(), None);
        let record: MediationRecord = self
            .ctx
            .engine
            .advance(
                self.profile,
                &record.thread_id,
                Step::sent(message.clone(), "mediate-deny"),
                RecordSeed::for_connection(&record.connection_id),
                |_| Ok(()),
            )
            .await?;
        self.connections().send_message(&record.connection_id, &message).await?;
        Ok(record)
    }

    /// Make a granted mediation the default, demoting any other
    pub async fn set_default(&self, mediation_id: &str) -> ProtocolResult<MediationRecord> {
        let _token = self
            .ctx
            .engine
            .locks()
            .acquire(ThreadLocks::key(self.profile.tenant_id(), MediationRecord::RECORD_TYPE, "~default"))
            .await;

        let mut target = self.get(mediation_id).await?;
        if target.role != Role::Requester || !target.is_granted() {
            return Err(ProtocolError::NotReady(format!(
                "mediation {} is {} as {}",
                mediation_id, target.state, target.role
            )));
        }

        let mut ops = Vec::new();
        let current: Vec<MediationRecord> =
            find_records(self.profile, TagFilter::eq("is_default", "true")).await?;
        for mut other in current.into_iter().filter(|m| m.mediation_id != mediation_id) {
            other.is_default = false;
            ops.push(WriteOp::Replace(other.to_storage()?));
        }
        target.is_default = true;
        ops.push(WriteOp::Replace(target.to_storage()?));
        self.profile.commit(ops).await?;

        info!(tenant = self.profile.tenant_id(), mediation = mediation_id, "default mediation set");
        Ok(target)
    }

    pub async fn get_default(&self) -> ProtocolResult<Option<MediationRecord>> {
        let defaults: Vec<MediationRecord> = find_records(self.profile, TagFilter::eq("is_default", "true")).await?;
        Ok(defaults.into_iter().next())
    }

    pub async fn clear_default(&self) -> ProtocolResult<()> {
        let defaults: Vec<MediationRecord> = find_records(self.profile, TagFilter::eq("is_default", "true")).await?;
        let ops = defaults
            .into_iter()
            .map(|mut m| {
                m.is_default = false;
                m.to_storage().map(WriteOp::Replace)
            })
            .collect::<ProtocolResult<Vec<_>>>()?;
        if !ops.is_empty() {
            self.profile.commit(ops).await?;
        }
        Ok(())
    }

    pub async fn routing_for(&self) -> ProtocolResult<Option<MediationRouting>> {
        Ok(self.get_default().await?.and_then(|m| {
            m.endpoint.map(|endpoint| MediationRouting {
                mediation_id: m.mediation_id,
                endpoint,
                routing_keys: m.routing_keys,
            })
        }))
    }

    /// Send keylist changes to the mediator of a granted mediation
    pub async fn send_keylist_update(
        &self,
        mediation_id: &str,
        updates: Vec<KeylistUpdateItem>,
    ) -> ProtocolResult<String> {
        let record = self.get(mediation_id).await?;
        if record.role != Role::Requester || !record.is_granted() {
            return Err(ProtocolError::NotReady(format!("mediation {} is not granted", mediation_id)));
        }
        let message = AgentMessage::new(self.uri("keylist-update"), serde_json::to_value(KeylistUpdateBody { updates })?);
        self.connections().send_message(&record.connection_id, &message).await?;
        Ok(message.id)
    }

    /// Register `verkey` with the default mediator, if there is one
    pub async fn add_key_to_default(&self, verkey: &str) -> ProtocolResult<()> {
        if let Some(default) = self.get_default().await? {
            self.send_keylist_update(&default.mediation_id, vec![KeylistUpdateItem::add(verkey)]).await?;
            debug!(tenant = self.profile.tenant_id(), key = verkey, "key registered with mediator");
        }
        Ok(())
    }

    /// Granted mediation this profile provides on `connection_id`
    async fn granted_for(&self, connection_id: &str) -> ProtocolResult<MediationRecord> {
        let records: Vec<MediationRecord> = find_records(
            self.profile,
            TagFilter::eq("connection_id", connection_id)
                .and(TagFilter::eq("role", Role::Mediator.as_str()))
                .and(TagFilter::eq("state", State::Granted.as_str())),
        )
        .await?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::NotReady(format!("no granted mediation for connection {}", connection_id)))
    }

    /// Apply an inbound coordinate-mediation message
    pub async fn receive(&self, inbound: &InboundMessage) -> ProtocolResult<Option<MediationRecord>> {
        let connection = inbound.require_connection()?;
        match inbound.msg_type.name {
            "mediate-request" | "mediate-grant" | "mediate-deny" | PROBLEM_REPORT => {
                let seed = RecordSeed::for_connection(&connection.connection_id);
                let record = self
                    .ctx
                    .engine
                    .advance(self.profile, inbound.thread_id(), Step::received(inbound), seed, |_| Ok(()))
                    .await?;
                Ok(Some(record))
            }
            "keylist-update" => {
                self.granted_for(&connection.connection_id).await?;
                let body: KeylistUpdateBody = inbound.message.body_as()?;
                let updated = self.routes().apply_keylist_update(&connection.connection_id, &body.updates).await;
                let reply = AgentMessage::new(
                    self.uri("keylist-update-response"),
                    serde_json::to_value(KeylistUpdateResponseBody { updated })?,
                )
                .with_thread(inbound.thread_id(), None);
                self.connections().send_on(connection, &reply).await?;
                Ok(None)
            }
            "keylist-query" => {
                self.granted_for(&connection.connection_id).await?;
                let keys = self
                    .routes()
                    .get_routes(&connection.connection_id)
                    .await?
                    .into_iter()
                    .map(|recipient_key| KeylistKey { recipient_key })
                    .collect();
                let reply = AgentMessage::new(self.uri("keylist"), serde_json::to_value(KeylistBody { keys })?)
                    .with_thread(inbound.thread_id(), None);
                self.connections().send_on(connection, &reply).await?;
                Ok(None)
            }
            "keylist-update-response" => {
                let body: KeylistUpdateResponseBody = inbound.message.body_as()?;
                for item in body.updated {
                    info!(
                        tenant = self.profile.tenant_id(),
                        key = %item.recipient_key,
                        action = ?item.action,
                        result = ?item.result,
                        "keylist update acknowledged"
                    );
                }
                Ok(None)
            }
            "keylist" => {
                let body: KeylistBody = inbound.message.body_as()?;
                debug!(tenant = self.profile.tenant_id(), keys = body.keys.len(), "keylist received");
                Ok(None)
            }
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }

    /// Relay the payload of a `forward` message
    pub async fn receive_forward(&self, inbound: &InboundMessage) -> ProtocolResult<ForwardOutcome> {
        let forward: ForwardMessage = serde_json::from_slice(&inbound.plaintext)?;
        let to = forward.body.to;
        let payload = forward.body.msg.get().as_bytes().to_vec();

        if let Some(tenant_id) = self.ctx.tenants.tenant_for_key(&to).await? {
            debug!(tenant = self.profile.tenant_id(), recipient = %to, local = %tenant_id, "forward to local tenant");
            self.ctx.events.emit(AgentEvent::Forwarded {
                tenant_id: self.profile.tenant_id().to_string(),
                recipient_key: to,
                target: RelayTarget::LocalTenant(tenant_id.clone()),
            });
            return Ok(ForwardOutcome::Local { tenant_id, payload });
        }

        let connection_id = self.routes().get_recipient(&to).await.map_err(ProtocolError::from)?;
        let message_id = self.relay(&connection_id, payload).await?;
        self.ctx.events.emit(AgentEvent::Forwarded {
            tenant_id: self.profile.tenant_id().to_string(),
            recipient_key: to,
            target: RelayTarget::Connection(connection_id.clone()),
        });
        Ok(ForwardOutcome::Queued { connection_id, message_id })
    }

    /// Queue an opaque envelope for the endpoint of `connection_id`
    pub async fn relay(&self, connection_id: &str, payload: Vec<u8>) -> ProtocolResult<String> {
        let connection = self.connections().get(connection_id).await?;
        let target = connection.delivery_target()?;
        let message_id = self.ctx.responder().send_packed(connection_id, &target.endpoint, payload).await?;
        info!(tenant = self.profile.tenant_id(), connection = connection_id, "payload relayed");
        Ok(message_id)
    }
}
