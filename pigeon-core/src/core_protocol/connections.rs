//! DID exchange operations for one profile

use super::didexchange::{
    ConnectionRecord, DidDoc, Invitation, InvitationRecord, RequestBody, ResponseBody, INVITATION_RECORD,
    INVITATION_TYPE,
};
use super::errors::{ProtocolError, ProtocolResult};
use super::message::{AgentMessage, InboundMessage};
use super::message_type::ProtocolFamily;
use super::record::{find_records, load, ProtocolRecord, RecordSeed, Step};
use crate::agent::AgentContext;
use crate::core_envelope::KeyPair;
use crate::core_mediation::MediationManager;
use crate::core_wallet::{current_timestamp_ms, Profile, StorageRecord, TagFilter, WriteOp};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub struct ConnectionManager<'a> {
    ctx: &'a AgentContext,
    profile: &'a Profile,
}

impl<'a> ConnectionManager<'a> {
    pub fn new(ctx: &'a AgentContext, profile: &'a Profile) -> Self {
        Self { ctx, profile }
    }

    fn uri(&self, name: &'static str) -> String {
        self.ctx.types.uri(ProtocolFamily::DidExchange, name)
    }

    fn mediation(&self) -> MediationManager<'a> {
        MediationManager::new(self.ctx, self.profile)
    }

    /// Endpoint and routing keys to advertise for a new key
    async fn my_endpoint(&self) -> ProtocolResult<(String, Vec<String>)> {
        Ok(match self.mediation().routing_for().await? {
            Some(routing) => (routing.endpoint, routing.routing_keys),
            None => (self.ctx.config.endpoint.clone(), Vec::new()),
        })
    }

    async fn my_key(&self, connection: &ConnectionRecord) -> ProtocolResult<KeyPair> {
        let verkey = connection
            .my_verkey
            .as_deref()
            .ok_or_else(|| ProtocolError::NotReady(format!("connection {} has no local key", connection.connection_id)))?;
        self.profile
            .fetch_key(verkey)
            .await?
            .ok_or_else(|| ProtocolError::NotReady(format!("key {} is not held", verkey)))
    }

    pub async fn create_invitation(&self, multi_use: bool) -> ProtocolResult<Invitation> {
        let key = self.profile.create_key().await?;
        let (service_endpoint, routing_keys) = self.my_endpoint().await?;
        let invitation = Invitation {
            id: Uuid::new_v4().to_string(),
            msg_type: format!("{}{}", self.ctx.types.emit_prefix(), INVITATION_TYPE),
            label: Some(self.ctx.label_for(self.profile)),
            recipient_keys: vec![key.verkey()],
            service_endpoint,
            routing_keys,
        };

        let stored = InvitationRecord { invitation: invitation.clone(), multi_use, created_at: current_timestamp_ms() };
        let record = StorageRecord::from_value(INVITATION_RECORD, &invitation.id, &stored)?
            .with_tag("recipient_key", key.verkey());
        self.profile.add(record).await?;
        self.mediation().add_key_to_default(&key.verkey()).await?;

        info!(tenant = self.profile.tenant_id(), invitation = %invitation.id, multi_use, "invitation created");
        Ok(invitation)
    }

    pub async fn receive_invitation(&self, invitation: &Invitation) -> ProtocolResult<ConnectionRecord> {
        let record = ConnectionRecord::from_invitation(invitation)?;
        self.profile.add(record.to_storage()?).await?;
        info!(tenant = self.profile.tenant_id(), connection = %record.connection_id, "invitation received");
        Ok(record)
    }

    pub async fn send_request(&self, connection_id: &str) -> ProtocolResult<ConnectionRecord> {
        let connection: ConnectionRecord = load(self.profile, connection_id).await?;
        let target = connection.delivery_target()?;

        let key = KeyPair::generate();
        let verkey = key.verkey();
        let (endpoint, routing_keys) = self.my_endpoint().await?;
        let did_doc = DidDoc::new(&verkey, &endpoint, routing_keys)?;
        let body = RequestBody { label: Some(self.ctx.label_for(self.profile)), did: did_doc.id.clone(), did_doc };
        let message = AgentMessage::new(self.uri("request"), serde_json::to_value(body)?)
            .with_id(connection.request_id.clone())
            .with_parent(connection.invitation_id.clone());

        let step = Step::sent(message.clone(), "request")
            .stage(self.profile.stage_key(&key)?)
            .with_new_key(verkey.clone());
        let connection: ConnectionRecord = self
            .ctx
            .engine
            .advance(self.profile, &connection.request_id, step, RecordSeed::default(), |r: &mut ConnectionRecord| {
                r.assign_key(&verkey)
            })
            .await?;

        self.mediation().add_key_to_default(&verkey).await?;
        self.ctx.responder().send(&key, &target, &message).await?;
        Ok(connection)
    }

    pub async fn send_response(&self, connection_id: &str) -> ProtocolResult<ConnectionRecord> {
        let connection: ConnectionRecord = load(self.profile, connection_id).await?;
        let target = connection.delivery_target()?;
        let invitation_key = connection
            .invitation_key
            .as_deref()
            .ok_or_else(|| ProtocolError::NotReady("connection has no invitation key".into()))?;
        let signer = self
            .profile
            .fetch_key(invitation_key)
            .await?
            .ok_or_else(|| ProtocolError::NotReady(format!("invitation key {} is not held", invitation_key)))?;

        let key = KeyPair::generate();
        let verkey = key.verkey();
        let (endpoint, routing_keys) = self.my_endpoint().await?;
        let body = ResponseBody::signed(DidDoc::new(&verkey, &endpoint, routing_keys)?, &signer)?;
        let message = AgentMessage::new(self.uri("response"), serde_json::to_value(body)?)
            .with_thread(connection.request_id.clone(), connection.invitation_id.clone());

        let step = Step::sent(message.clone(), "response")
            .stage(self.profile.stage_key(&key)?)
            .with_new_key(verkey.clone());
        let connection: ConnectionRecord = self
            .ctx
            .engine
            .advance(self.profile, &connection.request_id, step, RecordSeed::default(), |r: &mut ConnectionRecord| {
                r.assign_key(&verkey)
            })
            .await?;

        self.mediation().add_key_to_default(&verkey).await?;
        self.ctx.responder().send(&key, &target, &message).await?;
        Ok(connection)
    }

    pub async fn send_complete(&self, connection_id: &str) -> ProtocolResult<ConnectionRecord> {
        let connection: ConnectionRecord = load(self.profile, connection_id).await?;
        let target = connection.delivery_target()?;
        let key = self.my_key(&connection).await?;
        let message = AgentMessage::new(self.uri("complete"), json!({}))
            .with_thread(connection.request_id.clone(), connection.invitation_id.clone());

        let connection: ConnectionRecord = self
            .ctx
            .engine
            .advance(
                self.profile,
                &connection.request_id,
                Step::sent(message.clone(), "complete"),
                RecordSeed::default(),
                |_| Ok(()),
            )
            .await?;

        self.ctx.responder().send(&key, &target, &message).await?;
        Ok(connection)
    }

    /// Apply an inbound DID exchange message
    pub async fn receive(&self, inbound: &InboundMessage) -> ProtocolResult<ConnectionRecord> {
        let seed = RecordSeed {
            connection_id: inbound.connection_id().map(str::to_string),
            parent_thread_id: inbound.message.parent_thread_id().map(str::to_string),
        };
        let mut step = Step::received(inbound);

        if inbound.msg_type.name == "request" {
            let invitation = self
                .profile
                .find_one(INVITATION_RECORD, TagFilter::eq("recipient_key", &inbound.recipient_key))
                .await?
                .ok_or_else(|| {
                    ProtocolError::RecordNotFound(format!("no invitation for key {}", inbound.recipient_key))
                })?;
            let stored: InvitationRecord = invitation.value_as()?;
            if !stored.multi_use {
                step = step.stage(WriteOp::Delete {
                    record_type: INVITATION_RECORD.to_string(),
                    id: invitation.id.clone(),
                });
            }
        }

        self.ctx.engine.advance(self.profile, inbound.thread_id(), step, seed, |_| Ok(())).await
    }

    pub async fn get(&self, connection_id: &str) -> ProtocolResult<ConnectionRecord> {
        load(self.profile, connection_id).await
    }

    pub async fn list(&self) -> ProtocolResult<Vec<ConnectionRecord>> {
        find_records(self.profile, TagFilter::All).await
    }

    /// Connection a message unpacked with `recipient_key` arrived on
    ///
    /// A connection that already knows the peer only matches when the
    /// envelope was authcrypted by that peer.
    pub async fn find_by_keys(
        &self,
        recipient_key: &str,
        sender_key: Option<&str>,
    ) -> ProtocolResult<Option<ConnectionRecord>> {
        let candidates: Vec<ConnectionRecord> =
            find_records(self.profile, TagFilter::eq("my_verkey", recipient_key)).await?;
        Ok(candidates.into_iter().find(|c| match (&c.their_verkey, sender_key) {
            (Some(theirs), Some(sender)) => theirs == sender,
            (Some(_), None) => false,
            (None, _) => true,
        }))
    }

    /// Send `message` over an existing connection
    pub async fn send_message(&self, connection_id: &str, message: &AgentMessage) -> ProtocolResult<String> {
        let connection: ConnectionRecord = load(self.profile, connection_id).await?;
        self.send_on(&connection, message).await
    }

    pub async fn send_on(&self, connection: &ConnectionRecord, message: &AgentMessage) -> ProtocolResult<String> {
        let target = connection.delivery_target()?;
        let key = self.my_key(connection).await?;
        self.ctx.responder().send(&key, &target, message).await
    }

    /// Completed connection or `NotReady`
    pub async fn active(&self, connection_id: &str) -> ProtocolResult<ConnectionRecord> {
        let connection: ConnectionRecord = load(self.profile, connection_id).await?;
        if !connection.is_completed() {
            return Err(ProtocolError::NotReady(format!(
                "connection {} is {}",
                connection_id, connection.state
            )));
        }
        Ok(connection)
    }
}
