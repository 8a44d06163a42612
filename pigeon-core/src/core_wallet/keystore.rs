//! Sealing of secret key material at rest
//!
//! Key records hold the Ed25519 seed encrypted under a per-profile wallet key
//! derived with Argon2id (or supplied raw). The record id is the verkey.

use super::errors::{WalletError, WalletResult};
use super::record::{current_timestamp_ms, StorageRecord};
use super::settings::{KeyDerivation, ProfileSettings};
use crate::core_envelope::KeyPair;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const KEY_RECORD_TYPE: &str = "key";

const SEALED_PREFIX: &str = "xc20p:";
const PLAIN_PREFIX: &str = "plain:";
const NONCE_SIZE: usize = 24;
pub const SALT_SIZE: usize = 16;

/// Symmetric key protecting a profile's key records
pub struct WalletKey {
    key: Option<Zeroizing<[u8; 32]>>,
}

#[derive(Serialize, Deserialize)]
struct KeyEntry {
    verkey: String,
    secret: String,
    created_at: i64,
}

pub fn random_salt() -> String {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

impl WalletKey {
    pub fn unprotected() -> Self {
        Self { key: None }
    }

    pub fn derive(settings: &ProfileSettings, salt_hex: &str) -> WalletResult<Self> {
        let (m_cost, t_cost) = match settings.key_derivation {
            KeyDerivation::Unprotected => return Ok(Self::unprotected()),
            KeyDerivation::Raw => {
                let raw = settings
                    .wallet_key
                    .as_deref()
                    .ok_or_else(|| WalletError::InvalidInput("RAW derivation needs a key".into()))?;
                let bytes = Zeroizing::new(
                    bs58::decode(raw)
                        .into_vec()
                        .map_err(|e| WalletError::InvalidInput(format!("raw key is not base58: {}", e)))?,
                );
                let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    WalletError::InvalidInput("raw key must be 32 bytes".to_string())
                })?;
                return Ok(Self { key: Some(Zeroizing::new(key)) });
            }
            KeyDerivation::Argon2iMod => (19 * 1024, 2),
            KeyDerivation::Argon2iInt => (8 * 1024, 1),
        };

        let passphrase = settings
            .wallet_key
            .as_deref()
            .ok_or_else(|| WalletError::InvalidInput("wallet key required".to_string()))?;
        let salt = hex::decode(salt_hex)
            .map_err(|e| WalletError::Crypto(format!("corrupt key salt: {}", e)))?;

        let params = Params::new(m_cost, t_cost, 1, Some(32))
            .map_err(|e| WalletError::Crypto(format!("argon2 params: {}", e)))?;
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key[..])
            .map_err(|e| WalletError::Crypto(format!("key derivation failed: {}", e)))?;

        Ok(Self { key: Some(key) })
    }

    pub fn seal(&self, plaintext: &[u8]) -> WalletResult<String> {
        let Some(key) = &self.key else {
            return Ok(format!("{}{}", PLAIN_PREFIX, hex::encode(plaintext)));
        };

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = XChaCha20Poly1305::new((&**key).into())
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| WalletError::Crypto(format!("seal failed: {}", e)))?;

        let mut out = nonce.to_vec();
        out.extend(ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, hex::encode(out)))
    }

    pub fn open(&self, sealed: &str) -> WalletResult<Zeroizing<Vec<u8>>> {
        if let Some(plain) = sealed.strip_prefix(PLAIN_PREFIX) {
            if self.key.is_some() {
                return Err(WalletError::Crypto("unsealed secret in a protected profile".into()));
            }
            return hex::decode(plain)
                .map(Zeroizing::new)
                .map_err(|e| WalletError::Crypto(format!("corrupt secret: {}", e)));
        }

        let body = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| WalletError::Crypto("unknown secret encoding".to_string()))?;
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| WalletError::Crypto("sealed secret in an unprotected profile".into()))?;
        let bytes = hex::decode(body).map_err(|e| WalletError::Crypto(format!("corrupt secret: {}", e)))?;
        if bytes.len() < NONCE_SIZE {
            return Err(WalletError::Crypto("sealed secret too short".to_string()));
        }

        XChaCha20Poly1305::new((&**key).into())
            .decrypt(XNonce::from_slice(&bytes[..NONCE_SIZE]), &bytes[NONCE_SIZE..])
            .map(Zeroizing::new)
            .map_err(|_| WalletError::Crypto("wrong wallet key".to_string()))
    }

    pub fn key_record(&self, key: &KeyPair) -> WalletResult<StorageRecord> {
        let verkey = key.verkey();
        let entry = KeyEntry {
            verkey: verkey.clone(),
            secret: self.seal(&key.secret_bytes()[..])?,
            created_at: current_timestamp_ms(),
        };
        StorageRecord::from_value(KEY_RECORD_TYPE, verkey, &entry)
    }

    pub fn key_from_record(&self, record: &StorageRecord) -> WalletResult<KeyPair> {
        let entry: KeyEntry = record.value_as()?;
        let secret = self.open(&entry.secret)?;
        let key = KeyPair::from_secret_bytes(&secret).map_err(|e| WalletError::Crypto(e.to_string()))?;
        if key.verkey() != entry.verkey {
            return Err(WalletError::Crypto(format!("key record {} is corrupt", entry.verkey)));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interactive(passphrase: &str) -> ProfileSettings {
        ProfileSettings {
            key_derivation: KeyDerivation::Argon2iInt,
            wallet_key: Some(passphrase.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_argon_seal_round_trip() {
        let salt = random_salt();
        let wallet_key = WalletKey::derive(&interactive("correct horse"), &salt).unwrap();
        let key = KeyPair::generate();

        let record = wallet_key.key_record(&key).unwrap();
        assert_eq!(record.id, key.verkey());
        assert!(!record.value.contains(&hex::encode(&key.secret_bytes()[..])));

        let restored = wallet_key.key_from_record(&record).unwrap();
        assert_eq!(restored.verkey(), key.verkey());
    }

    #[test]
    fn test_passphrase_is_stretched_with_argon2id() {
        let salt = random_salt();
        let wallet_key = WalletKey::derive(&interactive("correct horse"), &salt).unwrap();

        let mut expected = [0u8; 32];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, Params::new(8 * 1024, 1, 1, Some(32)).unwrap())
            .hash_password_into(b"correct horse", &hex::decode(&salt).unwrap(), &mut expected)
            .unwrap();
        assert_eq!(wallet_key.key.as_deref(), Some(&expected));
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let salt = random_salt();
        let record = WalletKey::derive(&interactive("right"), &salt)
            .unwrap()
            .key_record(&KeyPair::generate())
            .unwrap();

        let wrong = WalletKey::derive(&interactive("wrong"), &salt).unwrap();
        assert!(matches!(wrong.key_from_record(&record), Err(WalletError::Crypto(_))));
    }

    #[test]
    fn test_raw_key() {
        let raw = bs58::encode([9u8; 32]).into_string();
        let settings = ProfileSettings {
            key_derivation: KeyDerivation::Raw,
            wallet_key: Some(raw),
            ..Default::default()
        };
        let wallet_key = WalletKey::derive(&settings, "").unwrap();
        let sealed = wallet_key.seal(b"seed").unwrap();
        assert_eq!(&wallet_key.open(&sealed).unwrap()[..], b"seed");

        let short = ProfileSettings { wallet_key: Some("abc".into()), ..settings };
        assert!(WalletKey::derive(&short, "").is_err());
    }

    #[test]
    fn test_unprotected_profiles() {
        let wallet_key = WalletKey::derive(&ProfileSettings::unprotected(), "").unwrap();
        let sealed = wallet_key.seal(b"seed").unwrap();
        assert!(sealed.starts_with(PLAIN_PREFIX));
        assert_eq!(&wallet_key.open(&sealed).unwrap()[..], b"seed");
    }

    #[test]
    fn test_missing_passphrase_is_rejected() {
        let settings = ProfileSettings::default();
        assert!(matches!(
            WalletKey::derive(&settings, &random_salt()),
            Err(WalletError::InvalidInput(_))
        ));
    }
}
