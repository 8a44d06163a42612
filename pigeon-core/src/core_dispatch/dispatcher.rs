/*
    Dispatcher - inbound message pipeline

    Every inbound envelope runs on its own worker, bounded by a semaphore:

    1. parse the envelope
    2. find the tenant holding one of its recipient keys
       (no tenant: relay the raw bytes if the base profile routes a key)
    3. unpack inside that tenant's profile
    4. drop message ids already seen by the tenant; a message that fails
       on storage or a busy profile is forgotten again so a redelivery
       gets processed
    5. resolve the connection and the message type
    6. hand the message to the family's manager; `forward` goes to the
       mediation coordinator and may loop back here for a local tenant

    Failures are logged, published as `InboundRejected`, and answered with a
    problem report when the message arrived on a connection.
*/

use super::errors::{DispatchError, DispatchResult};
use crate::agent::AgentContext;
use crate::config::DispatchConfig;
use crate::core_envelope::{unpack, Envelope};
use crate::core_mediation::{ForwardOutcome, MediationManager, MediationRecord, RoutingError, Routes};
use crate::core_protocol::{
    find_by_thread, AgentMessage, ConnectionManager, ConnectionRecord, CredentialExchange, CredentialManager,
    InboundMessage, PresentationExchange, PresentationManager, ProblemReportBody, ProtocolError, ProtocolFamily,
    State, PROBLEM_REPORT,
};
use crate::core_wallet::{Profile, WalletError};
use crate::events::{AgentEvent, RejectionKind, RelayTarget};
use hashlink::LruCache;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Nested `forward` messages followed before giving up
pub const MAX_RELAY_DEPTH: usize = 8;

/// Final result of processing one inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Applied to a record (or answered) in `tenant_id`
    Handled { tenant_id: String, thread_id: String, state: Option<State> },
    /// Queued unchanged for another agent
    Relayed { tenant_id: String, target: RelayTarget },
    Rejected { tenant_id: Option<String>, thread_id: Option<String>, kind: RejectionKind, reason: String },
}

impl DispatchOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, DispatchOutcome::Rejected { .. })
    }

    pub fn rejection_kind(&self) -> Option<RejectionKind> {
        match self {
            DispatchOutcome::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

enum Pass {
    Done(DispatchOutcome),
    /// Payload of a forward addressed to a local tenant
    Again(Vec<u8>),
}

/// What is known about a message when it fails
#[derive(Default)]
struct Attribution {
    profile: Option<Profile>,
    thread_id: Option<String>,
    connection: Option<ConnectionRecord>,
    family: Option<ProtocolFamily>,
    reportable: bool,
    /// Dedup entry recorded for this message
    marked: Option<String>,
}

pub struct Dispatcher {
    ctx: Arc<AgentContext>,
    seen: Mutex<LruCache<String, ()>>,
    permits: Arc<Semaphore>,
}

fn seen_key(tenant_id: &str, message_id: &str) -> String {
    format!("{}\u{1f}{}", tenant_id, message_id)
}

impl Dispatcher {
    pub fn new(ctx: Arc<AgentContext>, config: &DispatchConfig) -> Self {
        Self {
            ctx,
            seen: Mutex::new(LruCache::new(config.seen_capacity.max(1))),
            permits: Arc::new(Semaphore::new(config.max_concurrent_inbound.max(1))),
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Process `bytes` on a worker task
    pub fn handle_inbound(self: &Arc<Self>, bytes: Vec<u8>) -> JoinHandle<DispatchOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // The semaphore is never closed
            let _permit = this.permits.clone().acquire_owned().await.ok();
            this.process_inbound(&bytes).await
        })
    }

    pub async fn process_inbound(&self, bytes: &[u8]) -> DispatchOutcome {
        let mut payload = bytes.to_vec();
        for _ in 0..=MAX_RELAY_DEPTH {
            match self.dispatch_once(&payload).await {
                Pass::Done(outcome) => return outcome,
                Pass::Again(next) => payload = next,
            }
        }
        self.reject(&Attribution::default(), &DispatchError::RelayDepth(MAX_RELAY_DEPTH))
    }

    async fn dispatch_once(&self, bytes: &[u8]) -> Pass {
        let mut seen = Attribution::default();
        match self.try_dispatch(bytes, &mut seen).await {
            Ok(pass) => pass,
            Err(error) => {
                if error.is_retryable() {
                    // Left unanswered so the sender's retransmit can succeed
                    if let Some(key) = seen.marked.take() {
                        self.forget(&key);
                    }
                } else if seen.reportable {
                    self.report_problem(&seen, &error).await;
                }
                Pass::Done(self.reject(&seen, &error))
            }
        }
    }

    async fn try_dispatch(&self, bytes: &[u8], seen: &mut Attribution) -> DispatchResult<Pass> {
        let envelope = Envelope::from_bytes(bytes)?;
        let kids = envelope.recipient_kids()?;

        let profile = match self.owning_profile(&kids).await? {
            Some(profile) => profile,
            None => return self.relay_envelope(kids, bytes).await,
        };
        seen.profile = Some(profile.clone());
        let _active = profile.enter()?;

        let unpacked = unpack(&envelope, &profile).await?;
        let message = AgentMessage::from_bytes(&unpacked.plaintext)?;
        let thread_id = message.thread_id().to_string();
        seen.thread_id = Some(thread_id.clone());

        let key = seen_key(profile.tenant_id(), &message.id);
        if !self.first_sighting(&key) {
            return Err(DispatchError::Duplicate(message.id.clone()));
        }
        seen.marked = Some(key);

        let connection = ConnectionManager::new(&self.ctx, &profile)
            .find_by_keys(&unpacked.recipient_key, unpacked.sender_key.as_deref())
            .await?;
        seen.connection = connection.clone();

        let msg_type = self.ctx.types.resolve(&message.msg_type);
        seen.reportable = !msg_type.is_some_and(|t| t.is_problem_report());
        let msg_type = msg_type.ok_or_else(|| DispatchError::UnknownMessageType(message.msg_type.clone()))?;
        seen.family = Some(msg_type.family);

        debug!(
            tenant = profile.tenant_id(),
            thid = %thread_id,
            msg_type = %message.msg_type,
            connection = ?connection.as_ref().map(|c| &c.connection_id),
            "inbound message"
        );

        let inbound = InboundMessage {
            message,
            msg_type,
            sender_key: unpacked.sender_key,
            recipient_key: unpacked.recipient_key,
            connection,
            plaintext: unpacked.plaintext,
        };
        self.route(&profile, &inbound).await
    }

    async fn route(&self, profile: &Profile, inbound: &InboundMessage) -> DispatchResult<Pass> {
        let state = match inbound.msg_type.family {
            ProtocolFamily::Routing => {
                let outcome = MediationManager::new(&self.ctx, profile).receive_forward(inbound).await?;
                return Ok(match outcome {
                    ForwardOutcome::Local { payload, .. } => Pass::Again(payload),
                    ForwardOutcome::Queued { connection_id, .. } => Pass::Done(DispatchOutcome::Relayed {
                        tenant_id: profile.tenant_id().to_string(),
                        target: RelayTarget::Connection(connection_id),
                    }),
                });
            }
            ProtocolFamily::DidExchange => {
                Some(ConnectionManager::new(&self.ctx, profile).receive(inbound).await?.state)
            }
            ProtocolFamily::IssueCredential => {
                Some(CredentialManager::new(&self.ctx, profile).receive(inbound).await?.state)
            }
            ProtocolFamily::PresentProof => {
                Some(PresentationManager::new(&self.ctx, profile).receive(inbound).await?.state)
            }
            ProtocolFamily::CoordinateMediation => {
                MediationManager::new(&self.ctx, profile).receive(inbound).await?.map(|r| r.state)
            }
            ProtocolFamily::ReportProblem => Some(self.abandon_thread(profile, inbound).await?),
        };

        Ok(Pass::Done(DispatchOutcome::Handled {
            tenant_id: profile.tenant_id().to_string(),
            thread_id: inbound.thread_id().to_string(),
            state,
        }))
    }

    /// Apply a generic problem report to whichever record owns the thread
    async fn abandon_thread(&self, profile: &Profile, inbound: &InboundMessage) -> DispatchResult<State> {
        let thread_id = inbound.thread_id();
        if find_by_thread::<ConnectionRecord>(profile, thread_id).await?.is_some() {
            return Ok(ConnectionManager::new(&self.ctx, profile).receive(inbound).await?.state);
        }
        if find_by_thread::<CredentialExchange>(profile, thread_id).await?.is_some() {
            return Ok(CredentialManager::new(&self.ctx, profile).receive(inbound).await?.state);
        }
        if find_by_thread::<PresentationExchange>(profile, thread_id).await?.is_some() {
            return Ok(PresentationManager::new(&self.ctx, profile).receive(inbound).await?.state);
        }
        if find_by_thread::<MediationRecord>(profile, thread_id).await?.is_some() {
            let record = MediationManager::new(&self.ctx, profile).receive(inbound).await?;
            if let Some(record) = record {
                return Ok(record.state);
            }
        }
        Err(ProtocolError::RecordNotFound(format!("no record for thread {}", thread_id)).into())
    }

    /// First tenant holding one of `kids`
    async fn owning_profile(&self, kids: &[String]) -> DispatchResult<Option<Profile>> {
        for kid in kids {
            if let Some(profile) = self.ctx.tenants.profile_for_key(kid).await? {
                return Ok(Some(profile));
            }
        }
        Ok(None)
    }

    /// Relay an envelope addressed to a key the base profile routes
    async fn relay_envelope(&self, kids: Vec<String>, bytes: &[u8]) -> DispatchResult<Pass> {
        let base = match self.ctx.base_profile().await {
            Ok(profile) => profile,
            Err(WalletError::NotFound(_)) => return Err(DispatchError::NoRecipient(kids)),
            Err(e) => return Err(e.into()),
        };
        let _active = base.enter()?;

        let routes = Routes::new(&base);
        for kid in &kids {
            let connection_id = match routes.get_recipient(kid).await {
                Ok(connection_id) => connection_id,
                Err(RoutingError::NotFound(_)) => continue,
                Err(e) => return Err(ProtocolError::from(e).into()),
            };
            MediationManager::new(&self.ctx, &base).relay(&connection_id, bytes.to_vec()).await?;
            self.ctx.events.emit(AgentEvent::Forwarded {
                tenant_id: base.tenant_id().to_string(),
                recipient_key: kid.clone(),
                target: RelayTarget::Connection(connection_id.clone()),
            });
            return Ok(Pass::Done(DispatchOutcome::Relayed {
                tenant_id: base.tenant_id().to_string(),
                target: RelayTarget::Connection(connection_id),
            }));
        }
        Err(DispatchError::NoRecipient(kids))
    }

    fn seen_ids(&self) -> std::sync::MutexGuard<'_, LruCache<String, ()>> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn first_sighting(&self, key: &str) -> bool {
        let mut seen = self.seen_ids();
        if seen.get(key).is_some() {
            return false;
        }
        seen.insert(key.to_string(), ());
        true
    }

    fn forget(&self, key: &str) {
        self.seen_ids().remove(key);
    }

    /// Answer a failed message over the connection it arrived on
    async fn report_problem(&self, seen: &Attribution, error: &DispatchError) {
        let (Some(profile), Some(connection), Some(thread_id)) = (&seen.profile, &seen.connection, &seen.thread_id)
        else {
            return;
        };
        let family = match seen.family {
            Some(family) if family.message_names().contains(&PROBLEM_REPORT) => family,
            _ => ProtocolFamily::ReportProblem,
        };
        let body = match serde_json::to_value(ProblemReportBody::new(error.problem_code(), error.to_string())) {
            Ok(body) => body,
            Err(_) => return,
        };
        let report = AgentMessage::new(self.ctx.types.uri(family, PROBLEM_REPORT), body)
            .with_thread(thread_id.clone(), None);

        if let Err(e) = ConnectionManager::new(&self.ctx, profile).send_on(connection, &report).await {
            debug!(
                tenant = profile.tenant_id(),
                thid = %thread_id,
                error = %e,
                "problem report not sent"
            );
        }
    }

    fn reject(&self, seen: &Attribution, error: &DispatchError) -> DispatchOutcome {
        let tenant_id = seen.profile.as_ref().map(|p| p.tenant_id().to_string());
        let kind = error.kind();
        let reason = error.to_string();
        warn!(
            tenant = ?tenant_id,
            thid = ?seen.thread_id,
            kind = ?kind,
            reason = %reason,
            "inbound message rejected"
        );
        self.ctx.events.emit(AgentEvent::InboundRejected {
            tenant_id: tenant_id.clone(),
            thread_id: seen.thread_id.clone(),
            kind,
            reason: reason.clone(),
        });
        DispatchOutcome::Rejected { tenant_id, thread_id: seen.thread_id.clone(), kind, reason }
    }
}
