//! Envelope codec
//!
//! Converts plaintext agent messages to and from encrypted envelopes
//! addressed to one or more recipient verkeys.

pub mod codec;
pub mod errors;
pub mod jwe;
pub mod keys;

pub use codec::{pack, unpack, Unpacked};
pub use errors::{EnvelopeError, EnvelopeResult};
pub use jwe::{Envelope, PackAlg, ProtectedHeader};
pub use keys::{agreement_public, decode_verkey, verify_signature, KeyPair, KeyResolver, KeyRing};
