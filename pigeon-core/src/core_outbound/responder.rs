//! Packs agent messages for a peer and hands them to the queue

use super::queue::{DeliveryTarget, OutboundMessage, OutboundQueue};
use crate::core_envelope::{pack, KeyPair};
use crate::core_mediation::forward;
use crate::core_protocol::{AgentMessage, MessageTypeRegistry, ProtocolResult};
use tracing::debug;

pub struct Responder<'a> {
    queue: &'a OutboundQueue,
    types: &'a MessageTypeRegistry,
}

impl<'a> Responder<'a> {
    pub fn new(queue: &'a OutboundQueue, types: &'a MessageTypeRegistry) -> Self {
        Self { queue, types }
    }

    /// Authcrypt `message` from `sender` to the target, wrapping it in one
    /// forward per routing key
    pub async fn send(&self, sender: &KeyPair, target: &DeliveryTarget, message: &AgentMessage) -> ProtocolResult<String> {
        let envelope = pack(&message.to_bytes()?, &target.recipient_keys, Some(sender))?;
        let mut payload = envelope.to_bytes()?;
        if let Some(recipient) = target.recipient_keys.first() {
            payload = forward::wrap(payload, recipient, &target.routing_keys, self.types)?;
        }

        debug!(
            msg_type = %message.msg_type,
            thid = message.thread_id(),
            destination = %target.destination,
            hops = target.routing_keys.len(),
            "sending message"
        );
        self.send_packed(&target.destination, &target.endpoint, payload).await
    }

    /// Queue an already packed envelope unchanged
    pub async fn send_packed(&self, destination: &str, endpoint: &str, payload: Vec<u8>) -> ProtocolResult<String> {
        Ok(self.queue.enqueue(OutboundMessage::new(destination, endpoint, payload)).await?)
    }
}
