//! Cryptographic primitives for the peermesh overlay.
//!
//! All cryptography uses well-audited primitives:
//!
//! - **ECDSA P-256**: identity signatures
//! - **ECDH P-256**: pairwise key agreement
//! - **AES-256-GCM**: authenticated message encryption
//! - **HKDF-SHA256**: key derivation
//! - **HMAC-SHA256**: rendezvous slug derivation
//!
//! Signing private keys never leave this module; every other component
//! works with an [`Identity`] handle, base64 public-key strings, and
//! derived [`PairwiseKey`] material.

mod aead;
mod identity;
mod pairwise;
mod slug;

pub use aead::{decrypt, encrypt, EncryptedPayload, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use identity::{fingerprint_of, verify, verify_b64, Identity, FINGERPRINT_LEN};
pub use pairwise::{derive_shared, fingerprint_key, PairwiseKey};
pub use slug::{rendezvous_slug, window_index, SLUG_LEN};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Derive keys using HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::KeyDerive("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Random 32-hex-character token (discovery uuids, transfer ids).
pub fn random_token() -> String {
    hex::encode(random_bytes::<16>())
}
