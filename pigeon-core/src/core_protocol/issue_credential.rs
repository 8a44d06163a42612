//! Issue credential 2.0
//!
//! Credential formats are opaque here: previews, requests and credentials
//! are carried as JSON and kept on the exchange record.

use super::definition::{ProtocolDefinition, ISSUE_CREDENTIAL};
use super::errors::ProtocolResult;
use super::exchange::{ExchangeKind, ExchangeManager, ExchangeRecord};
use super::message_type::ProtocolFamily;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential;

impl ExchangeKind for Credential {
    const RECORD_TYPE: &'static str = "issue_credential";
    const FAMILY: ProtocolFamily = ProtocolFamily::IssueCredential;

    fn definition() -> &'static ProtocolDefinition {
        &ISSUE_CREDENTIAL
    }
}

pub type CredentialExchange = ExchangeRecord<Credential>;
pub type CredentialManager<'a> = ExchangeManager<'a, Credential>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewAttribute {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPreview {
    pub attributes: Vec<PreviewAttribute>,
}

impl CredentialPreview {
    pub fn new<I, N, V>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            attributes: attributes
                .into_iter()
                .map(|(name, value)| PreviewAttribute { name: name.into(), value: value.into(), mime_type: None })
                .collect(),
        }
    }

    fn body(&self) -> Value {
        json!({ "credential_preview": self })
    }
}

impl CredentialManager<'_> {
    /// Holder: propose a credential to an issuer
    pub async fn propose(&self, connection_id: &str, preview: &CredentialPreview) -> ProtocolResult<CredentialExchange> {
        self.start(connection_id, "propose-credential", preview.body()).await
    }

    /// Issuer: offer a credential without a prior proposal
    pub async fn offer(&self, connection_id: &str, preview: &CredentialPreview) -> ProtocolResult<CredentialExchange> {
        self.start(connection_id, "offer-credential", preview.body()).await
    }

    /// Issuer: answer a proposal with an offer
    pub async fn offer_on(&self, exchange_id: &str, preview: &CredentialPreview) -> ProtocolResult<CredentialExchange> {
        self.send(exchange_id, "offer-credential", preview.body()).await
    }

    /// Holder: answer an offer with a different proposal
    pub async fn counter_propose(
        &self,
        exchange_id: &str,
        preview: &CredentialPreview,
    ) -> ProtocolResult<CredentialExchange> {
        self.send(exchange_id, "propose-credential", preview.body()).await
    }

    pub async fn request(&self, exchange_id: &str, request: Value) -> ProtocolResult<CredentialExchange> {
        self.send(exchange_id, "request-credential", request).await
    }

    pub async fn issue(&self, exchange_id: &str, credential: Value) -> ProtocolResult<CredentialExchange> {
        self.send(exchange_id, "issue-credential", json!({ "credential": credential })).await
    }

    pub async fn ack(&self, exchange_id: &str) -> ProtocolResult<CredentialExchange> {
        self.send(exchange_id, "ack", json!({ "status": "OK" })).await
    }
}
