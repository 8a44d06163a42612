//! Present proof 2.0
//!
//! Requests name the attributes a verifier wants; presentations reveal
//! them. Cryptographic proof checking belongs to the credential format and
//! is not done here.

use super::definition::{ProtocolDefinition, PRESENT_PROOF};
use super::errors::ProtocolResult;
use super::exchange::{ExchangeKind, ExchangeManager, ExchangeRecord};
use super::message_type::ProtocolFamily;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presentation;

impl ExchangeKind for Presentation {
    const RECORD_TYPE: &'static str = "present_proof";
    const FAMILY: ProtocolFamily = ProtocolFamily::PresentProof;

    fn definition() -> &'static ProtocolDefinition {
        &PRESENT_PROOF
    }
}

pub type PresentationExchange = ExchangeRecord<Presentation>;
pub type PresentationManager<'a> = ExchangeManager<'a, Presentation>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationRequest {
    #[serde(default)]
    pub comment: Option<String>,
    pub requested_attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationBody {
    pub revealed_attributes: BTreeMap<String, String>,
}

/// Whether `presentation` reveals every attribute the request asked for
pub fn verify_presentation(request: Option<&Value>, presentation: &Value) -> bool {
    let Some(request) = request.and_then(|r| serde_json::from_value::<PresentationRequest>(r.clone()).ok()) else {
        return false;
    };
    let Ok(presented) = serde_json::from_value::<PresentationBody>(presentation.clone()) else {
        return false;
    };
    request
        .requested_attributes
        .iter()
        .all(|name| presented.revealed_attributes.contains_key(name))
}

impl PresentationManager<'_> {
    /// Prover: propose what it is willing to present
    pub async fn propose(&self, connection_id: &str, proposal: Value) -> ProtocolResult<PresentationExchange> {
        self.start(connection_id, "propose-presentation", proposal).await
    }

    /// Verifier: request a presentation without a prior proposal
    pub async fn request(&self, connection_id: &str, request: &PresentationRequest) -> ProtocolResult<PresentationExchange> {
        self.start(connection_id, "request-presentation", serde_json::to_value(request)?).await
    }

    /// Verifier: answer a proposal with a request
    pub async fn request_on(&self, exchange_id: &str, request: &PresentationRequest) -> ProtocolResult<PresentationExchange> {
        self.send(exchange_id, "request-presentation", serde_json::to_value(request)?).await
    }

    pub async fn present(&self, exchange_id: &str, presentation: &PresentationBody) -> ProtocolResult<PresentationExchange> {
        self.send(exchange_id, "presentation", serde_json::to_value(presentation)?).await
    }

    pub async fn ack(&self, exchange_id: &str) -> ProtocolResult<PresentationExchange> {
        self.send(exchange_id, "ack", json!({ "status": "OK" })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_presentation() {
        let request = json!({ "requested_attributes": ["name", "age"] });
        let full = json!({ "revealed_attributes": { "name": "Alice", "age": "30", "extra": "x" } });
        let partial = json!({ "revealed_attributes": { "name": "Alice" } });

        assert!(verify_presentation(Some(&request), &full));
        assert!(!verify_presentation(Some(&request), &partial));
        assert!(!verify_presentation(None, &full));
        assert!(!verify_presentation(Some(&request), &json!({ "garbage": true })));
    }
}
