//! Agent event stream
//!
//! Protocol transitions, rejected inbound messages, relays and delivery
//! outcomes are published on a broadcast channel so embedding applications
//! (and tests) can observe the runtime without polling storage.

use crate::core_protocol::State;
use tokio::sync::broadcast;

/// Why an inbound message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Parse,
    UnknownMessageType,
    InvalidTransition,
    Stale,
    NotFound,
    Duplicate,
    Routing,
    Storage,
}

/// Where a forwarded payload went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    /// Re-dispatched to a tenant hosted by this agent
    LocalTenant(String),
    /// Queued for the connection that registered the key
    Connection(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StateChanged {
        tenant_id: String,
        record_type: &'static str,
        record_id: String,
        thread_id: String,
        from: State,
        to: State,
    },
    InboundRejected {
        tenant_id: Option<String>,
        thread_id: Option<String>,
        kind: RejectionKind,
        reason: String,
    },
    Forwarded {
        tenant_id: String,
        recipient_key: String,
        target: RelayTarget,
    },
    Delivered {
        message_id: String,
        destination: String,
        attempts: u32,
    },
    DeliveryFailed {
        message_id: String,
        destination: String,
        attempts: u32,
        reason: String,
    },
}

impl AgentEvent {
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            AgentEvent::StateChanged { tenant_id, .. } | AgentEvent::Forwarded { tenant_id, .. } => {
                Some(tenant_id)
            }
            AgentEvent::InboundRejected { tenant_id, .. } => tenant_id.as_deref(),
            AgentEvent::Delivered { .. } | AgentEvent::DeliveryFailed { .. } => None,
        }
    }
}

/// Fan-out publisher for [`AgentEvent`]s
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBroadcaster {
    /// `capacity` events are buffered per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns how many subscribers saw the event
    pub fn emit(&self, event: AgentEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(id: &str) -> AgentEvent {
        AgentEvent::Delivered { message_id: id.to_string(), destination: "conn-1".into(), attempts: 1 }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let broadcaster = EventBroadcaster::new(4);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.emit(delivered("m1")), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let broadcaster = EventBroadcaster::new(4);
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();

        assert_eq!(broadcaster.emit(delivered("m1")), 2);
        assert_eq!(rx1.recv().await.unwrap(), delivered("m1"));
        assert_eq!(rx2.recv().await.unwrap(), delivered("m1"));
    }

    #[test]
    fn test_tenant_id_accessor() {
        let event = AgentEvent::InboundRejected {
            tenant_id: Some("alice".into()),
            thread_id: None,
            kind: RejectionKind::Stale,
            reason: "done".into(),
        };
        assert_eq!(event.tenant_id(), Some("alice"));
        assert_eq!(delivered("m").tenant_id(), None);
    }
}
