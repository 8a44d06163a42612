//! Plaintext agent messages
//!
//! One flat struct carries the common fields; the thread decorator is a
//! flattened sub-struct and the protocol-specific content lives in `body`.

use super::errors::{ProtocolError, ProtocolResult};
use super::message_type::MessageType;
use super::didexchange::ConnectionRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDecorator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub thread: ThreadDecorator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    /// Seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<u64>,
    #[serde(default)]
    pub body: Value,
}

impl AgentMessage {
    pub fn new(msg_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            thread: ThreadDecorator::default(),
            from: None,
            to: Vec::new(),
            created_time: SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs()),
            body,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Place the message on an existing thread
    pub fn with_thread(mut self, thid: impl Into<String>, pthid: Option<String>) -> Self {
        self.thread = ThreadDecorator { thid: Some(thid.into()), pthid };
        self
    }

    pub fn with_parent(mut self, pthid: Option<String>) -> Self {
        self.thread.pthid = pthid;
        self
    }

    /// Thread id, defaulting to the message id for thread-initiating messages
    pub fn thread_id(&self) -> &str {
        self.thread.thid.as_deref().unwrap_or(&self.id)
    }

    pub fn parent_thread_id(&self) -> Option<&str> {
        self.thread.pthid.as_deref()
    }

    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let message: AgentMessage = serde_json::from_slice(bytes)?;
        if message.id.is_empty() {
            return Err(ProtocolError::malformed("message id is empty"));
        }
        Ok(message)
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| ProtocolError::Malformed(format!("{} body: {}", self.msg_type, e)))
    }
}

/// Error code and description carried by a problem report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDescription {
    pub code: String,
    #[serde(default)]
    pub en: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReportBody {
    pub description: ProblemDescription,
}

impl ProblemReportBody {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { description: ProblemDescription { code: code.into(), en: description.into() } }
    }

    /// Lenient read; a report without a usable description still abandons
    pub fn error_info(message: &AgentMessage) -> ErrorInfo {
        match message.body_as::<ProblemReportBody>() {
            Ok(body) => ErrorInfo { code: body.description.code, description: body.description.en },
            Err(_) => ErrorInfo {
                code: "unspecified".to_string(),
                description: message.body.to_string(),
            },
        }
    }
}

/// A decrypted, type-resolved inbound message
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: AgentMessage,
    pub msg_type: MessageType,
    /// Verkey that authcrypted the envelope
    pub sender_key: Option<String>,
    /// Local verkey the envelope was unpacked with
    pub recipient_key: String,
    /// Connection the message arrived on, if any
    pub connection: Option<ConnectionRecord>,
    /// Decrypted plaintext exactly as received
    pub plaintext: Vec<u8>,
}

impl InboundMessage {
    pub fn thread_id(&self) -> &str {
        self.message.thread_id()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.connection_id.as_str())
    }

    pub fn require_connection(&self) -> ProtocolResult<&ConnectionRecord> {
        self.connection.as_ref().ok_or_else(|| {
            ProtocolError::NotReady(format!("{} arrived without a connection", self.message.msg_type))
        })
    }
}
