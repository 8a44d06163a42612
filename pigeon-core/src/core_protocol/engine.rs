//! Generic state machine engine
//!
//! `advance` serializes work per thread, looks the message up in the
//! record's transition table, runs the side effect and commits the record
//! together with any staged writes. Keys the step introduces are claimed for
//! the tenant first and released if the commit fails. A rejected message
//! leaves storage untouched.

use super::errors::{ProtocolError, ProtocolResult};
use super::message::ProblemReportBody;
use super::message_type::PROBLEM_REPORT;
use super::record::{find_by_thread, ProtocolRecord, RecordSeed, Step};
use super::state::State;
use super::thread_lock::ThreadLocks;
use crate::core_wallet::{current_timestamp_ms, Profile, WriteOp};
use crate::events::{AgentEvent, EventBroadcaster};
use tracing::debug;

#[derive(Clone)]
pub struct Engine {
    locks: ThreadLocks,
    events: EventBroadcaster,
}

impl Engine {
    pub fn new(events: EventBroadcaster) -> Self {
        Self { locks: ThreadLocks::new(), events }
    }

    pub fn locks(&self) -> &ThreadLocks {
        &self.locks
    }

    /// Apply `step` to the record of `thread_id`, creating it when the step
    /// starts a thread
    ///
    /// `prepare` runs after the table's side effect and may fill in fields
    /// the caller computed (new keys, DIDs). It is not called for problem
    /// reports.
    pub async fn advance<R, F>(
        &self,
        profile: &Profile,
        thread_id: &str,
        step: Step,
        seed: RecordSeed,
        prepare: F,
    ) -> ProtocolResult<R>
    where
        R: ProtocolRecord,
        F: FnOnce(&mut R) -> ProtocolResult<()> + Send,
    {
        let _active = profile.enter()?;
        let _token = self
            .locks
            .acquire(ThreadLocks::key(profile.tenant_id(), R::RECORD_TYPE, thread_id))
            .await;

        let definition = R::definition();
        let is_report = step.name == PROBLEM_REPORT;

        let mut record = match find_by_thread::<R>(profile, thread_id).await? {
            Some(existing) => {
                if let (Some(expected), Some(actual)) = (existing.connection_id(), seed.connection_id.as_deref()) {
                    if expected != actual {
                        return Err(ProtocolError::ConnectionMismatch {
                            thread_id: thread_id.to_string(),
                            expected: expected.to_string(),
                            actual: actual.to_string(),
                        });
                    }
                }
                existing
            }
            None => {
                let role = match definition.initiating_role(step.name, step.direction) {
                    Some(role) if !is_report => role,
                    _ => {
                        return Err(ProtocolError::RecordNotFound(format!(
                            "{} thread {}",
                            R::RECORD_TYPE,
                            thread_id
                        )))
                    }
                };
                R::start(thread_id, role, seed)
            }
        };

        let from = record.state();
        if definition.is_terminal(from) {
            return Err(ProtocolError::Stale { thread_id: thread_id.to_string(), state: from });
        }

        let to = if is_report {
            record.set_error(ProblemReportBody::error_info(&step.message));
            State::Abandoned
        } else {
            let transition = definition
                .lookup(from, step.name, record.role(), step.direction)
                .ok_or_else(|| ProtocolError::InvalidTransition {
                    state: from,
                    message: step.name.to_string(),
                    role: record.role(),
                })?;
            record.apply_effect(transition.effect, &step)?;
            prepare(&mut record)?;
            transition.to
        };
        record.set_state(to, current_timestamp_ms());

        let Step { staged, new_keys, direction, name, .. } = step;
        let mut ops = staged;
        ops.push(WriteOp::Upsert(record.to_storage()?));
        let claimed = profile.claim_keys(&new_keys).await?;
        if let Err(e) = profile.commit(ops).await {
            profile.release_keys(&claimed).await;
            return Err(e.into());
        }

        debug!(
            tenant = profile.tenant_id(),
            record_type = R::RECORD_TYPE,
            thid = thread_id,
            message = name,
            ?direction,
            %from,
            %to,
            "transition applied"
        );
        self.events.emit(AgentEvent::StateChanged {
            tenant_id: profile.tenant_id().to_string(),
            record_type: R::RECORD_TYPE,
            record_id: record.id().to_string(),
            thread_id: thread_id.to_string(),
            from,
            to,
        });

        Ok(record)
    }
}
