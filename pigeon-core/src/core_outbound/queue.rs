/*
  OutboundQueue - per destination delivery lanes

  Every destination connection gets its own FIFO lane drained by one worker
  task, so messages to one peer never overtake each other while a slow or
  failing peer cannot hold up the rest.

  enqueue(msg) ──► lane[msg.destination] ──► worker ──► transport.send
                                                │
                               transient failure: sleep(backoff), retry
                               success:           Delivered event
                               permanent / spent: DeliveryFailed event

  A worker that sees nothing for `lane_idle_timeout` unregisters its lane
  and exits; the next message for that destination starts a fresh lane.
*/

use super::errors::{OutboundError, OutboundResult, TransportError};
use super::transport::OutboundTransport;
use crate::config::OutboundConfig;
use crate::events::{AgentEvent, EventBroadcaster};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where and how to reach a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    /// Lane key, normally the connection id
    pub destination: String,
    pub endpoint: String,
    pub recipient_keys: Vec<String>,
    /// Mediator keys, innermost first
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: String,
    pub destination: String,
    pub endpoint: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<String>, endpoint: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            endpoint: endpoint.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OutboundConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Delay after the `attempt`-th failure: `initial * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboundConfig::default())
    }
}

type Lanes = Arc<Mutex<HashMap<String, mpsc::Sender<OutboundMessage>>>>;

fn lock_lanes(lanes: &Lanes) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<OutboundMessage>>> {
    lanes.lock().unwrap_or_else(|p| p.into_inner())
}

struct QueueInner {
    transport: Arc<dyn OutboundTransport>,
    policy: RetryPolicy,
    events: EventBroadcaster,
    lane_capacity: usize,
    idle_timeout: Duration,
    lanes: Lanes,
}

#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

impl OutboundQueue {
    pub fn new(transport: Arc<dyn OutboundTransport>, config: &OutboundConfig, events: EventBroadcaster) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                transport,
                policy: RetryPolicy::from_config(config),
                events,
                lane_capacity: config.lane_capacity.max(1),
                idle_timeout: config.lane_idle_timeout,
                lanes: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    /// Queue a message behind earlier ones for the same destination
    pub async fn enqueue(&self, message: OutboundMessage) -> OutboundResult<String> {
        if message.endpoint.is_empty() {
            return Err(OutboundError::InvalidDestination(message.destination));
        }
        let id = message.id.clone();
        let mut pending = message;
        // A lane closed under us (idle or gone) is replaced once
        for _ in 0..2 {
            let lane = self.lane(&pending.destination);
            match lane.send(pending).await {
                Ok(()) => {
                    debug!(message_id = %id, "outbound message queued");
                    return Ok(id);
                }
                Err(mpsc::error::SendError(returned)) => pending = returned,
            }
        }
        Err(OutboundError::Closed)
    }

    /// Destinations with a live lane
    pub fn lane_count(&self) -> usize {
        self.lanes().len()
    }

    fn lanes(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<OutboundMessage>>> {
        lock_lanes(&self.inner.lanes)
    }

    fn lane(&self, destination: &str) -> mpsc::Sender<OutboundMessage> {
        let mut lanes = self.lanes();
        if let Some(lane) = lanes.get(destination).filter(|l| !l.is_closed()) {
            return lane.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.lane_capacity);
        let worker = LaneWorker {
            destination: destination.to_string(),
            transport: self.inner.transport.clone(),
            policy: self.inner.policy,
            events: self.inner.events.clone(),
            idle_timeout: self.inner.idle_timeout,
            lanes: self.inner.lanes.clone(),
        };
        tokio::spawn(worker.run(tx.downgrade(), rx));
        lanes.insert(destination.to_string(), tx.clone());
        tx
    }
}

/// Drains one lane; shares only the lane table with the queue
struct LaneWorker {
    destination: String,
    transport: Arc<dyn OutboundTransport>,
    policy: RetryPolicy,
    events: EventBroadcaster,
    idle_timeout: Duration,
    lanes: Lanes,
}

impl LaneWorker {
    async fn run(self, own: mpsc::WeakSender<OutboundMessage>, mut rx: mpsc::Receiver<OutboundMessage>) {
        loop {
            match timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(message)) => self.deliver(message).await,
                Ok(None) => return,
                Err(_) => {
                    self.retire(&own, &mut rx);
                    break;
                }
            }
        }
        // Messages that slipped in before the close still go out, in order
        while let Some(message) = rx.recv().await {
            self.deliver(message).await;
        }
        debug!(destination = %self.destination, "idle lane closed");
    }

    /// Unregister this lane and refuse further sends; later enqueues open a new lane
    fn retire(&self, own: &mpsc::WeakSender<OutboundMessage>, rx: &mut mpsc::Receiver<OutboundMessage>) {
        let mut lanes = lock_lanes(&self.lanes);
        let registered = match (lanes.get(&self.destination), own.upgrade()) {
            (Some(current), Some(own)) => current.same_channel(&own),
            _ => false,
        };
        if registered {
            lanes.remove(&self.destination);
        }
        rx.close();
    }

    async fn deliver(&self, message: OutboundMessage) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.transport.send(&message.endpoint, &message.payload).await {
                Ok(()) => {
                    info!(
                        message_id = %message.id,
                        destination = %message.destination,
                        attempts = attempt,
                        "message delivered"
                    );
                    self.events.emit(AgentEvent::Delivered {
                        message_id: message.id,
                        destination: message.destination,
                        attempts: attempt,
                    });
                    return;
                }
                Err(e) => e,
            };

            if error.is_transient() && attempt < self.policy.max_attempts {
                let delay = self.policy.backoff(attempt);
                debug!(message_id = %message.id, attempt, ?delay, error = %error, "delivery failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(
                message_id = %message.id,
                destination = %message.destination,
                attempts = attempt,
                error = %error,
                "delivery failed"
            );
            let reason = match error {
                TransportError::Transient(reason) => format!("gave up after {} attempts: {}", attempt, reason),
                TransportError::Permanent(reason) => reason,
            };
            self.events.emit(AgentEvent::DeliveryFailed {
                message_id: message.id,
                destination: message.destination,
                attempts: attempt,
                reason,
            });
            return;
        }
    }
}
