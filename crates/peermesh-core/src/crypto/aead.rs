//! Authenticated encryption using AES-256-GCM.
//!
//! Every encrypted wire payload is an `(iv, ciphertext)` pair with a fresh
//! random 96-bit IV. The 16-byte GCM tag rides at the end of the
//! ciphertext. Failures decrypt to a generic error.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Size of the AES key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the GCM IV in bytes (96 bits).
pub const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// An `(iv, ciphertext)` pair as it travels on the wire, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Base64 of the 12-byte IV.
    pub iv: String,
    /// Base64 of ciphertext plus tag.
    pub ct: String,
}

impl EncryptedPayload {
    /// Build from raw parts.
    pub fn from_raw(iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Self {
        Self {
            iv: BASE64.encode(iv),
            ct: BASE64.encode(ciphertext),
        }
    }

    /// Decode back into raw parts.
    pub fn to_raw(&self) -> Result<([u8; IV_SIZE], Vec<u8>)> {
        let iv_bytes = BASE64.decode(&self.iv).map_err(|_| Error::DecryptFailed)?;
        let iv: [u8; IV_SIZE] = iv_bytes.try_into().map_err(|_| Error::DecryptFailed)?;
        let ct = BASE64.decode(&self.ct).map_err(|_| Error::DecryptFailed)?;
        Ok((iv, ct))
    }
}

/// Encrypt plaintext under a 256-bit key with a random IV.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::KeyDerive("encryption failed".into()))?;

    Ok(EncryptedPayload::from_raw(&iv, &ciphertext))
}

/// Decrypt an `(iv, ciphertext)` pair.
///
/// Returns a zeroized container, or [`Error::DecryptFailed`] if the tag
/// does not authenticate.
pub fn decrypt(key: &[u8; KEY_SIZE], payload: &EncryptedPayload) -> Result<Zeroizing<Vec<u8>>> {
    let (iv, ct) = payload.to_raw()?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_ref())
        .map_err(|_| Error::DecryptFailed)?;

    Ok(Zeroizing::new(plaintext))
}

/// Decrypt and interpret the plaintext as UTF-8.
pub fn decrypt_str(key: &[u8; KEY_SIZE], payload: &EncryptedPayload) -> Result<String> {
    let plain = decrypt(key, payload)?;
    String::from_utf8(plain.to_vec()).map_err(|_| Error::DecryptFailed)
}
