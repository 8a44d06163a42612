//! Coordinate mediation and routing message bodies

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateGrantBody {
    pub endpoint: String,
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeylistAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateItem {
    pub recipient_key: String,
    pub action: KeylistAction,
}

impl KeylistUpdateItem {
    pub fn add(recipient_key: impl Into<String>) -> Self {
        Self { recipient_key: recipient_key.into(), action: KeylistAction::Add }
    }

    pub fn remove(recipient_key: impl Into<String>) -> Self {
        Self { recipient_key: recipient_key.into(), action: KeylistAction::Remove }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateBody {
    pub updates: Vec<KeylistUpdateItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeylistResult {
    Success,
    NoChange,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdated {
    pub recipient_key: String,
    pub action: KeylistAction,
    pub result: KeylistResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateResponseBody {
    pub updated: Vec<KeylistUpdated>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistKey {
    pub recipient_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistBody {
    pub keys: Vec<KeylistKey>,
}

/// `forward` body; `msg` is kept as the exact bytes received
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardBody {
    pub to: String,
    pub msg: Box<RawValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub body: ForwardBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keylist_wire_names() {
        let updated = KeylistUpdated {
            recipient_key: "K".into(),
            action: KeylistAction::Remove,
            result: KeylistResult::NoChange,
        };
        assert_eq!(
            serde_json::to_string(&updated).unwrap(),
            r#"{"recipient_key":"K","action":"remove","result":"no_change"}"#
        );
    }

    #[test]
    fn test_forward_keeps_raw_bytes() {
        let inner = r#"{"protected":"abc",  "iv":"x","ciphertext":"y","tag":"z"}"#;
        let wire = format!(r#"{{"id":"1","type":"t","body":{{"to":"K","msg":{}}}}}"#, inner);
        let forward: ForwardMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(forward.body.msg.get(), inner);
        assert_eq!(serde_json::to_string(&forward).unwrap(), wire);
    }
}
