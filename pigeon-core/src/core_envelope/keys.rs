//! Agent key material
//!
//! Keys are Ed25519 and are identified by the base58 encoding of the public
//! key (the "verkey"). Envelope encryption uses the X25519 form of the same
//! key pair.

use super::errors::{EnvelopeError, EnvelopeResult};
use async_trait::async_trait;
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::fmt;
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_SIZE: usize = 32;

/// Ed25519 key pair; the secret half is wiped on drop
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rng().fill_bytes(&mut seed[..]);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; KEY_SIZE]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> EnvelopeResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(EnvelopeError::InvalidKey(format!(
                "secret key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
        seed.copy_from_slice(bytes);
        Ok(Self::from_seed(&seed))
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn verkey(&self) -> String {
        bs58::encode(self.signing.verifying_key().as_bytes()).into_string()
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// X25519 secret matching [`agreement_public`] of this key's verkey
    pub(crate) fn agreement_secret(&self) -> StaticSecret {
        let mut digest = Sha512::digest(self.signing.to_bytes());
        let mut scalar = [0u8; KEY_SIZE];
        scalar.copy_from_slice(&digest[..KEY_SIZE]);
        let secret = StaticSecret::from(scalar);
        scalar.zeroize();
        digest.as_mut_slice().zeroize();
        secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("verkey", &self.verkey()).finish_non_exhaustive()
    }
}

pub fn decode_verkey(verkey: &str) -> EnvelopeResult<VerifyingKey> {
    let bytes = bs58::decode(verkey)
        .into_vec()
        .map_err(|e| EnvelopeError::InvalidKey(format!("verkey is not base58: {}", e)))?;
    let bytes: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        EnvelopeError::InvalidKey(format!("verkey must decode to {} bytes", KEY_SIZE))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| EnvelopeError::InvalidKey(format!("verkey is not a curve point: {}", e)))
}

/// X25519 public key for a verkey
pub fn agreement_public(verkey: &str) -> EnvelopeResult<AgreementPublic> {
    let edwards = CompressedEdwardsY(decode_verkey(verkey)?.to_bytes())
        .decompress()
        .ok_or_else(|| EnvelopeError::InvalidKey("verkey does not decompress".to_string()))?;
    Ok(AgreementPublic::from(edwards.to_montgomery().to_bytes()))
}

pub fn verify_signature(verkey: &str, message: &[u8], signature: &[u8]) -> EnvelopeResult<bool> {
    let key = decode_verkey(verkey)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| EnvelopeError::InvalidKey(format!("bad signature encoding: {}", e)))?;
    Ok(key.verify(message, &signature).is_ok())
}

/// Lookup of locally held secret keys by verkey
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve_key(&self, verkey: &str) -> Option<KeyPair>;
}

/// In-memory resolver over a fixed set of keys
#[derive(Default, Clone)]
pub struct KeyRing {
    keys: HashMap<String, KeyPair>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: KeyPair) -> String {
        let verkey = key.verkey();
        self.keys.insert(verkey.clone(), key);
        verkey
    }

    pub fn contains(&self, verkey: &str) -> bool {
        self.keys.contains_key(verkey)
    }
}

#[async_trait]
impl KeyResolver for KeyRing {
    async fn resolve_key(&self, verkey: &str) -> Option<KeyPair> {
        self.keys.get(verkey).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verkey_round_trip() {
        let key = KeyPair::from_seed(&[7u8; KEY_SIZE]);
        let decoded = decode_verkey(&key.verkey()).unwrap();
        assert_eq!(decoded.to_bytes(), key.public_bytes());

        let restored = KeyPair::from_secret_bytes(&key.secret_bytes()[..]).unwrap();
        assert_eq!(restored.verkey(), key.verkey());
    }

    #[test]
    fn test_agreement_keys_match() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_pub = agreement_public(&alice.verkey()).unwrap();
        let bob_pub = agreement_public(&bob.verkey()).unwrap();

        let ab = alice.agreement_secret().diffie_hellman(&bob_pub);
        let ba = bob.agreement_secret().diffie_hellman(&alice_pub);
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_invalid_verkeys() {
        assert!(matches!(decode_verkey("0OIl"), Err(EnvelopeError::InvalidKey(_))));
        assert!(matches!(decode_verkey("abc"), Err(EnvelopeError::InvalidKey(_))));
        assert!(KeyPair::from_secret_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate();
        let sig = key.sign(b"payload");
        assert!(verify_signature(&key.verkey(), b"payload", &sig).unwrap());
        assert!(!verify_signature(&key.verkey(), b"tampered", &sig).unwrap());
    }

    #[tokio::test]
    async fn test_key_ring_resolves_held_keys() {
        let mut ring = KeyRing::new();
        let verkey = ring.insert(KeyPair::generate());

        assert!(ring.resolve_key(&verkey).await.is_some());
        assert!(ring.resolve_key(&KeyPair::generate().verkey()).await.is_none());
    }
}
