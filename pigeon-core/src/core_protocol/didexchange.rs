//! DID exchange records and message bodies

use super::definition::{Effect, ProtocolDefinition, DID_EXCHANGE};
use super::errors::{ProtocolError, ProtocolResult};
use super::message::ErrorInfo;
use super::record::{ProtocolRecord, RecordSeed, Step};
use super::state::{Role, State};
use crate::core_envelope::{decode_verkey, verify_signature, KeyPair};
use crate::core_outbound::DeliveryTarget;
use crate::core_wallet::{current_timestamp_ms, Tags};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CONNECTION_RECORD: &str = "connection";
pub const INVITATION_RECORD: &str = "invitation";
pub const INVITATION_TYPE: &str = "out-of-band/1.1/invitation";

/// `did:sov` style DID from the first half of a verkey
pub fn did_from_verkey(verkey: &str) -> ProtocolResult<String> {
    let key = decode_verkey(verkey)?;
    Ok(format!("did:sov:{}", bs58::encode(&key.as_bytes()[..16]).into_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDoc {
    pub id: String,
    pub verkey: String,
    pub service_endpoint: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

impl DidDoc {
    pub fn new(verkey: &str, service_endpoint: &str, routing_keys: Vec<String>) -> ProtocolResult<Self> {
        Ok(Self {
            id: did_from_verkey(verkey)?,
            verkey: verkey.to_string(),
            service_endpoint: service_endpoint.to_string(),
            routing_keys,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub label: Option<String>,
    pub did: String,
    pub did_doc: DidDoc,
}

/// Response carrying the inviter's new DID document, signed with the
/// invitation key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    pub did: String,
    pub did_doc: DidDoc,
    pub signer: String,
    pub signature: String,
}

impl ResponseBody {
    pub fn signed(did_doc: DidDoc, invitation_key: &KeyPair) -> ProtocolResult<Self> {
        let signature = invitation_key.sign(&serde_json::to_vec(&did_doc)?);
        Ok(Self {
            did: did_doc.id.clone(),
            did_doc,
            signer: invitation_key.verkey(),
            signature: URL_SAFE_NO_PAD.encode(signature),
        })
    }

    pub fn verify(&self, expected_signer: &str) -> ProtocolResult<()> {
        if self.signer != expected_signer {
            return Err(ProtocolError::Malformed(format!(
                "response signed by {} instead of the invitation key",
                self.signer
            )));
        }
        let signature = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|e| ProtocolError::Malformed(format!("response signature: {}", e)))?;
        if !verify_signature(&self.signer, &serde_json::to_vec(&self.did_doc)?, &signature)? {
            return Err(ProtocolError::malformed("response signature does not verify"));
        }
        Ok(())
    }
}

/// Out-of-band invitation, exchanged in plaintext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub label: Option<String>,
    pub recipient_keys: Vec<String>,
    pub service_endpoint: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

/// Invitation as kept by the inviter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationRecord {
    pub invitation: Invitation,
    pub multi_use: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    /// Thread of the DID exchange; the id of the `request`
    pub request_id: String,
    pub state: State,
    pub role: Role,
    #[serde(default)]
    pub invitation_id: Option<String>,
    #[serde(default)]
    pub invitation_key: Option<String>,
    #[serde(default)]
    pub my_did: Option<String>,
    #[serde(default)]
    pub my_verkey: Option<String>,
    #[serde(default)]
    pub their_did: Option<String>,
    #[serde(default)]
    pub their_verkey: Option<String>,
    #[serde(default)]
    pub their_endpoint: Option<String>,
    #[serde(default)]
    pub their_routing_keys: Vec<String>,
    #[serde(default)]
    pub their_label: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConnectionRecord {
    /// Invitee side record for a received invitation
    pub fn from_invitation(invitation: &Invitation) -> ProtocolResult<Self> {
        let invitation_key = invitation
            .recipient_keys
            .first()
            .ok_or_else(|| ProtocolError::malformed("invitation has no recipient keys"))?;
        decode_verkey(invitation_key)?;

        let mut record = Self::start(&Uuid::new_v4().to_string(), Role::Invitee, RecordSeed::default());
        record.invitation_id = Some(invitation.id.clone());
        record.invitation_key = Some(invitation_key.clone());
        record.their_endpoint = Some(invitation.service_endpoint.clone());
        record.their_routing_keys = invitation.routing_keys.clone();
        record.their_label = invitation.label.clone();
        Ok(record)
    }

    pub fn is_completed(&self) -> bool {
        self.state == State::Completed
    }

    /// Where messages to the peer go; before the response arrives the
    /// invitation key stands in for the peer's verkey
    pub fn delivery_target(&self) -> ProtocolResult<DeliveryTarget> {
        let recipient = self
            .their_verkey
            .as_ref()
            .or(self.invitation_key.as_ref().filter(|_| self.role == Role::Invitee))
            .ok_or_else(|| ProtocolError::NotReady(format!("connection {} has no peer key", self.connection_id)))?;
        let endpoint = self
            .their_endpoint
            .as_ref()
            .ok_or_else(|| ProtocolError::NotReady(format!("connection {} has no peer endpoint", self.connection_id)))?;
        Ok(DeliveryTarget {
            destination: self.connection_id.clone(),
            endpoint: endpoint.clone(),
            recipient_keys: vec![recipient.clone()],
            routing_keys: self.their_routing_keys.clone(),
        })
    }

    pub(crate) fn assign_key(&mut self, verkey: &str) -> ProtocolResult<()> {
        self.my_did = Some(did_from_verkey(verkey)?);
        self.my_verkey = Some(verkey.to_string());
        Ok(())
    }

    fn set_theirs(&mut self, did: &str, doc: &DidDoc, sender_key: Option<&str>) -> ProtocolResult<()> {
        if doc.id != did {
            return Err(ProtocolError::Malformed(format!("did {} does not match document {}", did, doc.id)));
        }
        if did_from_verkey(&doc.verkey)? != did {
            return Err(ProtocolError::Malformed(format!("did {} is not derived from its verkey", did)));
        }
        if let Some(sender) = sender_key {
            if sender != doc.verkey {
                return Err(ProtocolError::malformed("envelope sender does not match the DID document"));
            }
        }
        self.their_did = Some(did.to_string());
        self.their_verkey = Some(doc.verkey.clone());
        self.their_endpoint = Some(doc.service_endpoint.clone());
        self.their_routing_keys = doc.routing_keys.clone();
        Ok(())
    }
}

impl ProtocolRecord for ConnectionRecord {
    const RECORD_TYPE: &'static str = CONNECTION_RECORD;

    fn definition() -> &'static ProtocolDefinition {
        &DID_EXCHANGE
    }

    fn start(thread_id: &str, role: Role, seed: RecordSeed) -> Self {
        let now = current_timestamp_ms();
        Self {
            connection_id: Uuid::new_v4().to_string(),
            request_id: thread_id.to_string(),
            state: State::Start,
            role,
            invitation_id: seed.parent_thread_id,
            invitation_key: None,
            my_did: None,
            my_verkey: None,
            their_did: None,
            their_verkey: None,
            their_endpoint: None,
            their_routing_keys: Vec::new(),
            their_label: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn id(&self) -> &str {
        &self.connection_id
    }

    fn thread_id(&self) -> &str {
        &self.request_id
    }

    fn state(&self) -> State {
        self.state
    }

    fn role(&self) -> Role {
        self.role
    }

    fn connection_id(&self) -> Option<&str> {
        Some(&self.connection_id)
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
            Effect::AcceptRequest => {
                let body: RequestBody = step.message.body_as()?;
                self.set_theirs(&body.did, &body.did_doc, step.sender_key.as_deref())?;
                self.their_label = body.label;
                self.invitation_key = step.recipient_key.clone();
                self.invitation_id = step.message.parent_thread_id().map(str::to_string);
                Ok(())
            }
            Effect::AcceptResponse => {
                let body: ResponseBody = step.message.body_as()?;
                let invitation_key = self
                    .invitation_key
                    .as_deref()
                    .ok_or_else(|| ProtocolError::NotReady("connection has no invitation key".into()))?;
                body.verify(invitation_key)?;
                self.set_theirs(&body.did, &body.did_doc, step.sender_key.as_deref())
            }
            _ => Ok(()),
        }
    }

    fn extra_tags(&self) -> Tags {
        let mut tags = Tags::new();
        for (name, value) in [
            ("my_verkey", &self.my_verkey),
            ("their_verkey", &self.their_verkey),
            ("invitation_key", &self.invitation_key),
        ] {
            if let Some(value) = value {
                tags.insert(name.to_string(), value.clone());
            }
        }
        tags
    }
}
