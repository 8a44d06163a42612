//! Per-tenant profile settings

use serde::{Deserialize, Serialize};

/// How the secret protecting a profile's keys is turned into a sealing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyDerivation {
    /// Argon2id, moderate cost; the `ARGON2I_*` names are the wallet key method names
    #[default]
    Argon2iMod,
    /// Argon2id, interactive cost
    Argon2iInt,
    /// The secret is a base58 encoded 32 byte key
    Raw,
    /// Key secrets are stored unsealed
    Unprotected,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default)]
    pub key_derivation: KeyDerivation,

    /// Passphrase or raw key; required unless derivation is `Unprotected`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_key: Option<String>,

    /// Free-form tenant metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProfileSettings {
    pub fn unprotected() -> Self {
        Self { key_derivation: KeyDerivation::Unprotected, ..Default::default() }
    }

    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self { wallet_key: Some(passphrase.into()), ..Default::default() }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
