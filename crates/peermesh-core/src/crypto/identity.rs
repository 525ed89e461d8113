//! ECDSA P-256 identity keypairs.
//!
//! The identity is created on first launch and never rotated; losing the
//! private key is equivalent to becoming a new identity. The public key
//! travels on the wire as a base64 string of the uncompressed SEC1 point;
//! the fingerprint (first 8 bytes of its SHA-256, hex) is the stable,
//! human-comparable handle for a contact.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// Length of a rendered fingerprint in hex characters (8 bytes).
pub const FINGERPRINT_LEN: usize = 16;

/// A local ECDSA P-256 identity.
///
/// Holds the only copy of the signing key; other components receive the
/// base64 public key and the fingerprint.
pub struct Identity {
    secret: SecretKey,
    signing: SigningKey,
    public_b64: String,
    fingerprint: String,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        Self::from_secret(secret)
    }

    /// Restore an identity from raw secret scalar bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|_| Error::KeyDerive("invalid secret key".into()))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let signing = SigningKey::from(&secret);
        let public = secret.public_key();
        let raw = public.to_encoded_point(false);
        let public_b64 = BASE64.encode(raw.as_bytes());
        let fingerprint = fingerprint_bytes(raw.as_bytes());
        Self {
            secret,
            signing,
            public_b64,
            fingerprint,
        }
    }

    /// Export the secret scalar for storage.
    ///
    /// The bytes must be written only to the local key-value store.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// The base64-encoded uncompressed public key.
    pub fn public_key_b64(&self) -> &str {
        &self.public_b64
    }

    /// The 16-hex-character fingerprint of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Borrow the secret key for ECDH key agreement.
    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Sign a message, returning the fixed-size 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing.sign(msg);
        sig.to_bytes().to_vec()
    }

    /// Sign a message and base64-encode the signature for the wire.
    pub fn sign_b64(&self, msg: &[u8]) -> String {
        BASE64.encode(self.sign(msg))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Verify a 64-byte signature against a base64 public key.
pub fn verify(public_b64: &str, signature: &[u8], msg: &[u8]) -> Result<()> {
    let key = decode_public(public_b64)?;
    let verifying = VerifyingKey::from(&key);
    let sig = Signature::from_slice(signature).map_err(|_| Error::VerifyFailed)?;
    verifying.verify(msg, &sig).map_err(|_| Error::VerifyFailed)
}

/// Verify a base64-encoded signature against a base64 public key.
pub fn verify_b64(public_b64: &str, signature_b64: &str, msg: &[u8]) -> Result<()> {
    let sig = BASE64
        .decode(signature_b64)
        .map_err(|_| Error::VerifyFailed)?;
    verify(public_b64, &sig, msg)
}

/// Compute the fingerprint of a base64 public key.
///
/// First 8 bytes of SHA-256 over the raw key bytes, rendered as hex.
/// Stable across restarts and address changes.
pub fn fingerprint_of(public_b64: &str) -> Result<String> {
    let raw = BASE64
        .decode(public_b64)
        .map_err(|_| Error::KeyDerive("invalid public key encoding".into()))?;
    Ok(fingerprint_bytes(&raw))
}

pub(crate) fn decode_public(public_b64: &str) -> Result<PublicKey> {
    let raw = BASE64
        .decode(public_b64)
        .map_err(|_| Error::KeyDerive("invalid public key encoding".into()))?;
    PublicKey::from_sec1_bytes(&raw).map_err(|_| Error::KeyDerive("invalid public key point".into()))
}

fn fingerprint_bytes(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_shape() {
        let id = Identity::generate();
        assert_eq!(id.fingerprint().len(), FINGERPRINT_LEN);
        assert!(id.fingerprint().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_stable_across_restore() {
        let id = Identity::generate();
        let restored = Identity::from_secret_bytes(&id.secret_bytes()).expect("restore");
        assert_eq!(id.fingerprint(), restored.fingerprint());
        assert_eq!(id.public_key_b64(), restored.public_key_b64());
    }

    #[test]
    fn test_fingerprint_of_matches_identity() {
        let id = Identity::generate();
        let fp = fingerprint_of(id.public_key_b64()).expect("fingerprint");
        assert_eq!(fp, id.fingerprint());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let id = Identity::generate();
        let sig = id.sign(b"hello overlay");
        verify(id.public_key_b64(), &sig, b"hello overlay").expect("verify");
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let id = Identity::generate();
        let sig = id.sign(b"hello overlay");
        assert!(verify(id.public_key_b64(), &sig, b"hello 0verlay").is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let a = Identity::generate();
        let b = Identity::generate();
        let sig = a.sign(b"msg");
        assert!(verify(b.public_key_b64(), &sig, b"msg").is_err());
    }

    #[test]
    fn test_verify_b64() {
        let id = Identity::generate();
        let sig = id.sign_b64(b"ts|addr");
        verify_b64(id.public_key_b64(), &sig, b"ts|addr").expect("verify");
        assert!(verify_b64(id.public_key_b64(), "not base64!!", b"ts|addr").is_err());
    }
}
