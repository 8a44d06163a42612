//! In-process transports
//!
//! [`RecordingTransport`] keeps every payload and can be told to fail;
//! [`LoopbackTransport`] hands payloads straight to the agent registered for
//! the endpoint.

use crate::agent::Agent;
use crate::core_dispatch::Dispatcher;
use crate::core_outbound::{OutboundTransport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    failures: Mutex<HashMap<String, (TransportError, usize)>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends to `endpoint` with `error`
    pub fn fail_next(&self, endpoint: &str, error: TransportError, count: usize) {
        lock(&self.failures).insert(endpoint.to_string(), (error, count));
    }

    /// Successful sends in delivery order
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, endpoint: &str) -> Vec<Vec<u8>> {
        lock(&self.sent).iter().filter(|(e, _)| e == endpoint).map(|(_, p)| p.clone()).collect()
    }

    /// Attempts made against `endpoint`, failed ones included
    pub fn attempts(&self, endpoint: &str) -> usize {
        lock(&self.attempts).get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<(), TransportError> {
        *lock(&self.attempts).entry(endpoint.to_string()).or_default() += 1;

        let mut failures = lock(&self.failures);
        if let Some((error, remaining)) = failures.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        drop(failures);

        lock(&self.sent).push((endpoint.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Delivers to agents in the same process by endpoint
#[derive(Default)]
pub struct LoopbackTransport {
    agents: Mutex<HashMap<String, Weak<Dispatcher>>>,
    recorder: RecordingTransport,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route `endpoint` to `agent`
    pub fn register(&self, endpoint: &str, agent: &Agent) {
        lock(&self.agents).insert(endpoint.to_string(), Arc::downgrade(agent.dispatcher()));
    }

    pub fn unregister(&self, endpoint: &str) {
        lock(&self.agents).remove(endpoint);
    }

    /// Everything delivered so far, across all endpoints
    pub fn recorder(&self) -> &RecordingTransport {
        &self.recorder
    }
}

#[async_trait]
impl OutboundTransport for LoopbackTransport {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<(), TransportError> {
        let target = lock(&self.agents).get(endpoint).and_then(Weak::upgrade);
        let dispatcher = match target {
            Some(dispatcher) => dispatcher,
            None => return Err(TransportError::Permanent(format!("no agent at {}", endpoint))),
        };
        self.recorder.send(endpoint, payload).await?;
        dispatcher.handle_inbound(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_transport_fails_then_records() {
        let transport = RecordingTransport::new();
        transport.fail_next("http://a", TransportError::Transient("busy".into()), 1);

        assert!(transport.send("http://a", b"one").await.is_err());
        transport.send("http://a", b"two").await.unwrap();
        transport.send("http://b", b"three").await.unwrap();

        assert_eq!(transport.attempts("http://a"), 2);
        assert_eq!(transport.sent_to("http://a"), vec![b"two".to_vec()]);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_loopback_rejects_unknown_endpoint() {
        let transport = LoopbackTransport::new();
        let err = transport.send("loop://nobody", b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::Permanent(_)));
    }
}
