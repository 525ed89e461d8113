//! Pairwise key agreement.
//!
//! Both sides of a contact derive the same AES-256-GCM key from
//! ECDH-P256 over the identity keys, expanded through HKDF-SHA256.
//! The key fingerprint (truncated SHA-256 of the raw key bytes) is cached
//! on the contact record so restarts can verify the cached key without
//! re-running the agreement.

use crate::crypto::identity::{decode_public, Identity};
use crate::crypto::{hkdf_derive, KEY_SIZE};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain separation for the pairwise HKDF expansion.
const PAIRWISE_INFO: &[u8] = b"peermesh pairwise key v1";

/// A derived pairwise AES-256 key.
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PairwiseKey([u8; KEY_SIZE]);

impl PairwiseKey {
    /// Wrap raw key bytes (used when restoring from the store).
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes for the AEAD layer.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Truncated SHA-256 fingerprint of the raw key bytes.
    pub fn fingerprint(&self) -> String {
        fingerprint_key(&self.0)
    }
}

impl fmt::Debug for PairwiseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairwiseKey([REDACTED])")
    }
}

/// Derive the shared AES key between our identity and a peer public key.
///
/// Deterministic and symmetric: `derive_shared(a, pub_b)` equals
/// `derive_shared(b, pub_a)`.
pub fn derive_shared(identity: &Identity, peer_public_b64: &str) -> Result<PairwiseKey> {
    let peer = decode_public(peer_public_b64)?;
    let shared = p256::ecdh::diffie_hellman(
        identity.secret_key().to_nonzero_scalar(),
        peer.as_affine(),
    );
    let okm = hkdf_derive(None, shared.raw_secret_bytes(), PAIRWISE_INFO, KEY_SIZE)?;
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&okm);
    Ok(PairwiseKey(key))
}

/// Hex-truncated SHA-256 fingerprint of raw key bytes (16 hex chars).
pub fn fingerprint_key(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..8])
}
