//! Async test helpers
//!
//! Timeout wrappers around the agent event stream.

use crate::core_protocol::State;
use crate::events::AgentEvent;
use std::fmt;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Next value from a broadcast channel, skipping over lag
pub async fn recv_timeout<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Err(_) => return Err(RecvTimeoutError::Timeout),
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return Err(RecvTimeoutError::Closed),
        }
    }
}

/// First event matching `predicate`, discarding the others
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<AgentEvent>,
    duration: Duration,
    mut predicate: F,
) -> Result<AgentEvent, RecvTimeoutError>
where
    F: FnMut(&AgentEvent) -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = recv_timeout(rx, remaining).await?;
        if predicate(&event) {
            return Ok(event);
        }
    }
}

/// Wait until a `record_type` record in `tenant_id` enters `state`; returns its id
pub async fn wait_for_state(
    rx: &mut broadcast::Receiver<AgentEvent>,
    tenant_id: &str,
    record_type: &str,
    state: State,
) -> Result<String, RecvTimeoutError> {
    let event = wait_for_event(rx, Duration::from_secs(5), |event| {
        matches!(
            event,
            AgentEvent::StateChanged { tenant_id: t, record_type: r, to, .. }
                if t == tenant_id && *r == record_type && *to == state
        )
    })
    .await?;
    match event {
        AgentEvent::StateChanged { record_id, .. } => Ok(record_id),
        _ => Err(RecvTimeoutError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBroadcaster, RejectionKind};

    #[tokio::test]
    async fn test_recv_timeout_times_out() {
        let events = EventBroadcaster::default();
        let mut rx = events.subscribe();
        let result = recv_timeout(&mut rx, Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), RecvTimeoutError::Timeout);
    }

    #[tokio::test]
    async fn test_wait_for_event_skips_others() {
        let events = EventBroadcaster::default();
        let mut rx = events.subscribe();
        events.emit(AgentEvent::Delivered { message_id: "1".into(), destination: "a".into(), attempts: 1 });
        events.emit(AgentEvent::InboundRejected {
            tenant_id: None,
            thread_id: None,
            kind: RejectionKind::Parse,
            reason: "bad".into(),
        });

        let event = wait_for_event(&mut rx, Duration::from_secs(1), |e| {
            matches!(e, AgentEvent::InboundRejected { .. })
        })
        .await
        .unwrap();
        assert!(matches!(event, AgentEvent::InboundRejected { kind: RejectionKind::Parse, .. }));
    }
}
