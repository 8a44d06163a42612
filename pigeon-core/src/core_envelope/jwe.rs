//! Envelope wire format
//!
//! JSON object with a base64url protected header, IV, ciphertext and tag.
//! The protected header lists every recipient's wrapped content key and is
//! bound to the body as AEAD associated data.

use super::errors::{EnvelopeError, EnvelopeResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const ENC_XCHACHA: &str = "xchacha20poly1305_ietf";
pub const ENVELOPE_TYP: &str = "JWM/1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackAlg {
    /// Sender stays anonymous
    Anoncrypt,
    /// Sender key is bound into every key wrap
    Authcrypt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientHeader {
    /// Recipient verkey
    pub kid: String,
    /// Ephemeral X25519 public key
    pub epk: String,
    /// Nonce used to wrap the content key
    pub iv: String,
    /// Sender verkey sealed to the recipient (authcrypt only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub enc: String,
    pub typ: String,
    pub alg: PackAlg,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub protected: String,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

impl ProtectedHeader {
    pub fn encode(&self) -> EnvelopeResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| EnvelopeError::Encode(format!("protected header: {}", e)))?;
        Ok(b64_encode(&json))
    }

    pub fn decode(protected: &str) -> EnvelopeResult<Self> {
        let json = b64_decode(protected, "protected")?;
        serde_json::from_slice(&json)
            .map_err(|e| EnvelopeError::Parse(format!("protected header: {}", e)))
    }
}

impl Envelope {
    pub fn to_bytes(&self) -> EnvelopeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> EnvelopeResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Parse(e.to_string()))
    }

    pub fn header(&self) -> EnvelopeResult<ProtectedHeader> {
        ProtectedHeader::decode(&self.protected)
    }

    /// Verkeys this envelope is addressed to
    pub fn recipient_kids(&self) -> EnvelopeResult<Vec<String>> {
        Ok(self.header()?.recipients.into_iter().map(|r| r.header.kid).collect())
    }
}

pub(crate) fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn b64_decode(value: &str, field: &str) -> EnvelopeResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| EnvelopeError::Parse(format!("{} is not base64url: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_header_encoding() {
        let header = ProtectedHeader {
            enc: ENC_XCHACHA.to_string(),
            typ: ENVELOPE_TYP.to_string(),
            alg: PackAlg::Authcrypt,
            recipients: vec![Recipient {
                encrypted_key: "a2V5".into(),
                header: RecipientHeader {
                    kid: "kid1".into(),
                    epk: "ZXBr".into(),
                    iv: "aXY".into(),
                    sender: Some("c2VuZGVy".into()),
                },
            }],
        };

        let encoded = header.encode().unwrap();
        assert!(!encoded.contains('='));
        assert_eq!(ProtectedHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_rejects_non_envelopes() {
        assert!(matches!(Envelope::from_bytes(b"not json"), Err(EnvelopeError::Parse(_))));
        assert!(matches!(
            Envelope::from_bytes(br#"{"protected":"x"}"#),
            Err(EnvelopeError::Parse(_))
        ));
        assert!(matches!(ProtectedHeader::decode("!!!"), Err(EnvelopeError::Parse(_))));
    }

    #[test]
    fn test_anoncrypt_omits_sender() {
        let header = RecipientHeader { kid: "k".into(), epk: "e".into(), iv: "i".into(), sender: None };
        let json = serde_json::to_string(&header).unwrap();
        assert!(!json.contains("sender"));
    }
}
