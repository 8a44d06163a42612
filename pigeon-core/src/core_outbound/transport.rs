//! Contract for sending packed envelopes to an endpoint

use super::errors::TransportError;
use async_trait::async_trait;

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<(), TransportError>;
}
