//! Forward wrapping for mediated delivery

use super::messages::{ForwardBody, ForwardMessage};
use crate::core_envelope::pack;
use crate::core_protocol::{MessageTypeRegistry, ProtocolError, ProtocolFamily, ProtocolResult};
use serde_json::value::RawValue;
use uuid::Uuid;

pub fn forward_message(types: &MessageTypeRegistry, to: &str, packed: Vec<u8>) -> ProtocolResult<ForwardMessage> {
    let raw = String::from_utf8(packed).map_err(|e| ProtocolError::Malformed(format!("packed envelope: {}", e)))?;
    Ok(ForwardMessage {
        id: Uuid::new_v4().to_string(),
        msg_type: types.uri(ProtocolFamily::Routing, "forward"),
        body: ForwardBody { to: to.to_string(), msg: RawValue::from_string(raw)? },
    })
}

/// Wrap `packed` (addressed to `recipient_key`) once per routing key
///
/// Each layer is anoncrypted to the next routing key; the innermost
/// routing key is applied first.
pub fn wrap(
    packed: Vec<u8>,
    recipient_key: &str,
    routing_keys: &[String],
    types: &MessageTypeRegistry,
) -> ProtocolResult<Vec<u8>> {
    let mut payload = packed;
    let mut to = recipient_key.to_string();
    for routing_key in routing_keys {
        let forward = forward_message(types, &to, payload)?;
        let envelope = pack(&serde_json::to_vec(&forward)?, std::slice::from_ref(routing_key), None)?;
        payload = envelope.to_bytes()?;
        to = routing_key.clone();
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_envelope::{unpack, Envelope, KeyPair, KeyRing};

    #[tokio::test]
    async fn test_each_hop_sees_only_the_next_layer() {
        let types = MessageTypeRegistry::default();
        let recipient = KeyPair::generate();
        let mut outer_ring = KeyRing::new();
        let outer = outer_ring.insert(KeyPair::generate());
        let mut inner_ring = KeyRing::new();
        let inner = inner_ring.insert(KeyPair::generate());

        let packed = pack(b"secret", &[recipient.verkey()], None).unwrap().to_bytes().unwrap();
        let wrapped = wrap(packed.clone(), &recipient.verkey(), &[inner.clone(), outer.clone()], &types).unwrap();

        // Outermost layer opens with the last routing key and names the next hop
        let first = unpack(&Envelope::from_bytes(&wrapped).unwrap(), &outer_ring).await.unwrap();
        let forward: ForwardMessage = serde_json::from_slice(&first.plaintext).unwrap();
        assert_eq!(forward.body.to, inner);
        assert!(unpack(&Envelope::from_bytes(&wrapped).unwrap(), &inner_ring).await.is_err());

        let second = unpack(&Envelope::from_bytes(forward.body.msg.get().as_bytes()).unwrap(), &inner_ring)
            .await
            .unwrap();
        let forward: ForwardMessage = serde_json::from_slice(&second.plaintext).unwrap();
        assert_eq!(forward.body.to, recipient.verkey());
        assert_eq!(forward.body.msg.get().as_bytes(), packed.as_slice());
    }

    #[test]
    fn test_no_routing_keys_is_identity() {
        let types = MessageTypeRegistry::default();
        let bytes = b"{\"x\":1}".to_vec();
        assert_eq!(wrap(bytes.clone(), "K", &[], &types).unwrap(), bytes);
    }
}
