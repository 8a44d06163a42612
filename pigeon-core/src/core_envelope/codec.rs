//! Pack and unpack
//!
//! A random content key encrypts the body with XChaCha20-Poly1305. For every
//! recipient the content key is wrapped under a key derived from an
//! ephemeral X25519 exchange with the recipient's agreement key; authcrypt
//! mixes in a static exchange with the sender's key, so only the holder of
//! the sender secret could have produced the wrap.

use super::errors::{EnvelopeError, EnvelopeResult};
use super::jwe::{
    b64_decode, b64_encode, Envelope, PackAlg, ProtectedHeader, Recipient, RecipientHeader,
    ENC_XCHACHA, ENVELOPE_TYP,
};
use super::keys::{agreement_public, KeyPair, KeyResolver, KEY_SIZE};
use chacha20poly1305::aead::{Aead, AeadInPlace, KeyInit, Payload};
use chacha20poly1305::{Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

const ANONCRYPT_KEK_LABEL: &[u8] = b"pigeon envelope 1.0 anoncrypt kek";
const AUTHCRYPT_KEK_LABEL: &[u8] = b"pigeon envelope 1.0 authcrypt kek";
const SENDER_KEY_LABEL: &[u8] = b"pigeon envelope 1.0 sender";

/// Result of a successful unpack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub plaintext: Vec<u8>,
    /// Present only for authcrypt envelopes
    pub sender_key: Option<String>,
    pub recipient_key: String,
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rng().fill_bytes(&mut out);
    out
}

fn derive_key(ikm: &[u8], salt: &[u8], label: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    // 32 bytes is far below the HKDF-SHA256 output limit
    let _ = hk.expand(label, &mut okm[..]);
    okm
}

fn kek_salt(epk: &AgreementPublic, recipient: &AgreementPublic) -> [u8; 64] {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(epk.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    salt
}

fn seal(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> EnvelopeResult<Vec<u8>> {
    XChaCha20Poly1305::new(key.into())
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|e| EnvelopeError::Encode(format!("key wrap failed: {}", e)))
}

fn open(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_SIZE {
        return None;
    }
    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &[] })
        .ok()
        .map(Zeroizing::new)
}

/// Encrypt `plaintext` to every key in `recipient_keys`
///
/// With `sender` set the envelope is authcrypted by that key. Malformed
/// recipient keys or an empty recipient list fail with
/// [`EnvelopeError::Encode`].
pub fn pack(
    plaintext: &[u8],
    recipient_keys: &[String],
    sender: Option<&KeyPair>,
) -> EnvelopeResult<Envelope> {
    if recipient_keys.is_empty() {
        return Err(EnvelopeError::Encode("no recipients".to_string()));
    }

    let cek = Zeroizing::new(random_bytes::<KEY_SIZE>());
    let sender_secret = sender.map(KeyPair::agreement_secret);
    let sender_verkey = sender.map(KeyPair::verkey);

    let mut recipients = Vec::with_capacity(recipient_keys.len());
    for kid in recipient_keys {
        let recipient_pub = agreement_public(kid)
            .map_err(|e| EnvelopeError::Encode(format!("recipient {}: {}", kid, e)))?;

        let eph_secret = StaticSecret::from(random_bytes::<KEY_SIZE>());
        let eph_pub = AgreementPublic::from(&eph_secret);
        let eph_shared = eph_secret.diffie_hellman(&recipient_pub);
        let salt = kek_salt(&eph_pub, &recipient_pub);

        let (kek, sealed_sender) = match (&sender_secret, &sender_verkey) {
            (Some(static_secret), Some(verkey)) => {
                let static_shared = static_secret.diffie_hellman(&recipient_pub);
                let mut ikm = Zeroizing::new(Vec::with_capacity(64));
                ikm.extend_from_slice(eph_shared.as_bytes());
                ikm.extend_from_slice(static_shared.as_bytes());

                let sender_key = derive_key(eph_shared.as_bytes(), &salt, SENDER_KEY_LABEL);
                let sender_nonce = random_bytes::<NONCE_SIZE>();
                let mut sealed = sender_nonce.to_vec();
                sealed.extend(seal(&sender_key, &sender_nonce, verkey.as_bytes())?);

                (derive_key(&ikm, &salt, AUTHCRYPT_KEK_LABEL), Some(b64_encode(&sealed)))
            }
            _ => (derive_key(eph_shared.as_bytes(), &salt, ANONCRYPT_KEK_LABEL), None),
        };

        let wrap_nonce = random_bytes::<NONCE_SIZE>();
        let encrypted_key = seal(&kek, &wrap_nonce, &cek[..])?;

        recipients.push(Recipient {
            encrypted_key: b64_encode(&encrypted_key),
            header: RecipientHeader {
                kid: kid.clone(),
                epk: b64_encode(eph_pub.as_bytes()),
                iv: b64_encode(&wrap_nonce),
                sender: sealed_sender,
            },
        });
    }

    let header = ProtectedHeader {
        enc: ENC_XCHACHA.to_string(),
        typ: ENVELOPE_TYP.to_string(),
        alg: if sender.is_some() { PackAlg::Authcrypt } else { PackAlg::Anoncrypt },
        recipients,
    };
    let protected = header.encode()?;

    let iv = random_bytes::<NONCE_SIZE>();
    let mut body = plaintext.to_vec();
    let tag = XChaCha20Poly1305::new((&*cek).into())
        .encrypt_in_place_detached(XNonce::from_slice(&iv), protected.as_bytes(), &mut body)
        .map_err(|e| EnvelopeError::Encode(format!("body encryption failed: {}", e)))?;

    Ok(Envelope {
        protected,
        iv: b64_encode(&iv),
        ciphertext: b64_encode(&body),
        tag: b64_encode(tag.as_slice()),
    })
}

/// Recover the content key from one recipient entry
fn unwrap_cek(
    recipient: &Recipient,
    alg: PackAlg,
    key: &KeyPair,
) -> EnvelopeResult<(Zeroizing<[u8; KEY_SIZE]>, Option<String>)> {
    let header = &recipient.header;
    let epk: [u8; KEY_SIZE] = b64_decode(&header.epk, "epk")?
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::Parse("epk must be 32 bytes".to_string()))?;
    let eph_pub = AgreementPublic::from(epk);
    let wrap_nonce = b64_decode(&header.iv, "recipient iv")?;
    let encrypted_key = b64_decode(&recipient.encrypted_key, "encrypted_key")?;

    let secret = key.agreement_secret();
    let my_pub = AgreementPublic::from(&secret);
    let eph_shared = secret.diffie_hellman(&eph_pub);
    let salt = kek_salt(&eph_pub, &my_pub);

    let (kek, sender_key) = match alg {
        PackAlg::Anoncrypt => (derive_key(eph_shared.as_bytes(), &salt, ANONCRYPT_KEK_LABEL), None),
        PackAlg::Authcrypt => {
            let sealed = header
                .sender
                .as_deref()
                .ok_or_else(|| EnvelopeError::Parse("authcrypt recipient without sender".to_string()))?;
            let sealed = b64_decode(sealed, "sender")?;
            if sealed.len() < NONCE_SIZE + TAG_SIZE {
                return Err(EnvelopeError::Parse("sender field too short".to_string()));
            }
            let sender_wrap = derive_key(eph_shared.as_bytes(), &salt, SENDER_KEY_LABEL);
            let sender_bytes = open(&sender_wrap, &sealed[..NONCE_SIZE], &sealed[NONCE_SIZE..])
                .ok_or_else(|| EnvelopeError::Parse("sender key does not open".to_string()))?;
            let sender_verkey = String::from_utf8(sender_bytes.to_vec())
                .map_err(|_| EnvelopeError::Parse("sender key is not utf-8".to_string()))?;

            let sender_pub = agreement_public(&sender_verkey)
                .map_err(|e| EnvelopeError::Parse(format!("sender key: {}", e)))?;
            let static_shared = secret.diffie_hellman(&sender_pub);
            let mut ikm = Zeroizing::new(Vec::with_capacity(64));
            ikm.extend_from_slice(eph_shared.as_bytes());
            ikm.extend_from_slice(static_shared.as_bytes());

            (derive_key(&ikm, &salt, AUTHCRYPT_KEK_LABEL), Some(sender_verkey))
        }
    };

    let cek = open(&kek, &wrap_nonce, &encrypted_key)
        .ok_or_else(|| EnvelopeError::Parse("content key does not unwrap".to_string()))?;
    let cek: [u8; KEY_SIZE] = cek
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::Parse("content key must be 32 bytes".to_string()))?;
    Ok((Zeroizing::new(cek), sender_key))
}

/// Decrypt an envelope with the first held recipient key that works
///
/// Fails with [`EnvelopeError::Parse`] when the envelope is malformed, no
/// recipient key is held, or the ciphertext does not authenticate.
pub async fn unpack(envelope: &Envelope, resolver: &dyn KeyResolver) -> EnvelopeResult<Unpacked> {
    let header = envelope.header()?;
    if header.enc != ENC_XCHACHA {
        return Err(EnvelopeError::Parse(format!("unsupported enc '{}'", header.enc)));
    }

    let iv = b64_decode(&envelope.iv, "iv")?;
    if iv.len() != NONCE_SIZE {
        return Err(EnvelopeError::Parse("iv must be 24 bytes".to_string()));
    }
    let tag = b64_decode(&envelope.tag, "tag")?;
    if tag.len() != TAG_SIZE {
        return Err(EnvelopeError::Parse("tag must be 16 bytes".to_string()));
    }
    let ciphertext = b64_decode(&envelope.ciphertext, "ciphertext")?;

    let mut last_error = None;
    for recipient in &header.recipients {
        let Some(key) = resolver.resolve_key(&recipient.header.kid).await else {
            continue;
        };

        let (cek, sender_key) = match unwrap_cek(recipient, header.alg, &key) {
            Ok(unwrapped) => unwrapped,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };

        let mut plaintext = ciphertext.clone();
        XChaCha20Poly1305::new((&*cek).into())
            .decrypt_in_place_detached(
                XNonce::from_slice(&iv),
                envelope.protected.as_bytes(),
                &mut plaintext,
                Tag::from_slice(&tag),
            )
            .map_err(|_| EnvelopeError::Parse("ciphertext failed authentication".to_string()))?;

        return Ok(Unpacked {
            plaintext,
            sender_key,
            recipient_key: recipient.header.kid.clone(),
        });
    }

    Err(last_error.unwrap_or_else(|| EnvelopeError::Parse("no recipient key is held".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_envelope::keys::KeyRing;
    use proptest::prelude::*;

    fn ring_with(key: &KeyPair) -> KeyRing {
        let mut ring = KeyRing::new();
        ring.insert(key.clone());
        ring
    }

    #[tokio::test]
    async fn test_anoncrypt_round_trip() {
        let bob = KeyPair::generate();
        let envelope = pack(b"hello bob", &[bob.verkey()], None).unwrap();

        let unpacked = unpack(&envelope, &ring_with(&bob)).await.unwrap();
        assert_eq!(unpacked.plaintext, b"hello bob");
        assert_eq!(unpacked.sender_key, None);
        assert_eq!(unpacked.recipient_key, bob.verkey());
    }

    #[tokio::test]
    async fn test_authcrypt_reports_sender() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let envelope = pack(b"from alice", &[bob.verkey()], Some(&alice)).unwrap();

        assert_eq!(envelope.header().unwrap().alg, PackAlg::Authcrypt);
        let unpacked = unpack(&envelope, &ring_with(&bob)).await.unwrap();
        assert_eq!(unpacked.sender_key, Some(alice.verkey()));
    }

    #[tokio::test]
    async fn test_multiple_recipients() {
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let envelope = pack(b"to both", &[bob.verkey(), carol.verkey()], None).unwrap();

        assert_eq!(envelope.recipient_kids().unwrap(), vec![bob.verkey(), carol.verkey()]);
        let for_carol = unpack(&envelope, &ring_with(&carol)).await.unwrap();
        assert_eq!(for_carol.recipient_key, carol.verkey());
        assert_eq!(for_carol.plaintext, b"to both");
    }

    #[tokio::test]
    async fn test_unheld_key_fails_to_parse() {
        let bob = KeyPair::generate();
        let envelope = pack(b"secret", &[bob.verkey()], None).unwrap();

        let err = unpack(&envelope, &KeyRing::new()).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Parse(_)));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let bob = KeyPair::generate();
        let mut envelope = pack(b"integrity matters", &[bob.verkey()], None).unwrap();
        let mut body = b64_decode(&envelope.ciphertext, "ciphertext").unwrap();
        body[0] ^= 0x01;
        envelope.ciphertext = b64_encode(&body);

        assert!(matches!(unpack(&envelope, &ring_with(&bob)).await, Err(EnvelopeError::Parse(_))));
    }

    #[tokio::test]
    async fn test_protected_header_is_authenticated() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut envelope = pack(b"bound", &[bob.verkey()], Some(&alice)).unwrap();

        let mut header = envelope.header().unwrap();
        header.typ = "JWM/2.0".to_string();
        envelope.protected = header.encode().unwrap();

        assert!(unpack(&envelope, &ring_with(&bob)).await.is_err());
    }

    #[tokio::test]
    async fn test_forged_sender_is_rejected() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let bob = KeyPair::generate();

        // Mallory claims to be alice by swapping the sealed sender field from
        // another envelope; the static exchange no longer matches.
        let genuine = pack(b"genuine", &[bob.verkey()], Some(&alice)).unwrap();
        let forged = pack(b"forged", &[bob.verkey()], Some(&mallory)).unwrap();

        let mut header = forged.header().unwrap();
        header.recipients[0].header.sender =
            genuine.header().unwrap().recipients[0].header.sender.clone();
        let mut tampered = forged.clone();
        tampered.protected = header.encode().unwrap();

        assert!(unpack(&tampered, &ring_with(&bob)).await.is_err());
    }

    #[test]
    fn test_pack_rejects_bad_recipients() {
        assert!(matches!(pack(b"x", &[], None), Err(EnvelopeError::Encode(_))));
        assert!(matches!(
            pack(b"x", &["not-a-key".to_string()], None),
            Err(EnvelopeError::Encode(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_round_trip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..512), auth in any::<bool>()) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let sender = KeyPair::generate();
            let bob = KeyPair::generate();
            let envelope = pack(&payload, &[bob.verkey()], auth.then_some(&sender)).unwrap();
            let bytes = envelope.to_bytes().unwrap();

            let parsed = Envelope::from_bytes(&bytes).unwrap();
            let unpacked = runtime.block_on(unpack(&parsed, &ring_with(&bob))).unwrap();
            prop_assert_eq!(unpacked.plaintext, payload);
            prop_assert_eq!(unpacked.sender_key, auth.then(|| sender.verkey()));
        }
    }
}
