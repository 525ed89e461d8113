//! Group key lifecycle.
//!
//! The group key is a random AES-256-GCM key, generated at group creation
//! and replaced by a fresh random key on every rotation (member leave or
//! kick). Superseded keys are archived so older messages stay readable;
//! they are never used to encrypt again. Keys travel only wrapped under a
//! pairwise key between the distributing router and each member.

use crate::crypto::{self, EncryptedPayload, PairwiseKey, KEY_SIZE};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use zeroize::Zeroizing;

/// How many superseded keys are kept for decrypting old messages.
const KEY_HISTORY_DEPTH: usize = 8;

/// Generate a fresh random group key.
pub fn generate_group_key() -> [u8; KEY_SIZE] {
    crypto::random_bytes::<KEY_SIZE>()
}

/// The current group key plus its bounded history.
pub struct GroupKeyring {
    current: Zeroizing<[u8; KEY_SIZE]>,
    history: Vec<Zeroizing<[u8; KEY_SIZE]>>,
}

impl GroupKeyring {
    /// Keyring holding only the given key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            current: Zeroizing::new(key),
            history: Vec::new(),
        }
    }

    /// Restore from persisted base64 parts.
    pub fn from_b64(current: &str, history: &[String]) -> Result<Self> {
        let mut keyring = Self::new(decode_key(current)?);
        for item in history {
            keyring.history.push(Zeroizing::new(decode_key(item)?));
        }
        keyring.history.truncate(KEY_HISTORY_DEPTH);
        Ok(keyring)
    }

    /// The current key.
    pub fn current(&self) -> &[u8; KEY_SIZE] {
        &self.current
    }

    /// Base64 of the current key, for persistence.
    pub fn current_b64(&self) -> String {
        BASE64.encode(*self.current)
    }

    /// Base64 history, newest first, for persistence.
    pub fn history_b64(&self) -> Vec<String> {
        self.history.iter().map(|k| BASE64.encode(**k)).collect()
    }

    /// Archive the current key and install a fresh random one.
    pub fn rotate(&mut self) {
        let old = std::mem::replace(&mut self.current, Zeroizing::new(generate_group_key()));
        self.history.insert(0, old);
        self.history.truncate(KEY_HISTORY_DEPTH);
    }

    /// Install a key received from the router (distribute or rotate).
    ///
    /// The previous current key is archived; installing the key we already
    /// hold is a no-op.
    pub fn install(&mut self, key: [u8; KEY_SIZE]) {
        if *self.current == key {
            return;
        }
        let old = std::mem::replace(&mut self.current, Zeroizing::new(key));
        self.history.insert(0, old);
        self.history.truncate(KEY_HISTORY_DEPTH);
    }

    /// Encrypt under the current key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        crypto::encrypt(&self.current, plaintext)
    }

    /// Decrypt, falling back through the key history for older messages.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Zeroizing<Vec<u8>>> {
        if let Ok(plain) = crypto::decrypt(&self.current, payload) {
            return Ok(plain);
        }
        for key in &self.history {
            if let Ok(plain) = crypto::decrypt(key, payload) {
                return Ok(plain);
            }
        }
        Err(Error::DecryptFailed)
    }

    /// Wrap the current key for one member under a pairwise key.
    pub fn wrap_for(&self, pairwise: &PairwiseKey) -> Result<EncryptedPayload> {
        crypto::encrypt(pairwise.as_bytes(), &*self.current)
    }
}

/// Unwrap a distributed group key with the pairwise key it was wrapped
/// under.
pub fn unwrap_key(pairwise: &PairwiseKey, payload: &EncryptedPayload) -> Result<[u8; KEY_SIZE]> {
    let plain = crypto::decrypt(pairwise.as_bytes(), payload)?;
    plain
        .as_slice()
        .try_into()
        .map_err(|_| Error::DecryptFailed)
}

fn decode_key(b64: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|_| Error::KeyDerive("invalid group key encoding".into()))?;
    bytes
        .try_into()
        .map_err(|_| Error::KeyDerive("invalid group key length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_shared, Identity};

    #[test]
    fn test_history_decrypts_after_rotation() {
        let mut keyring = GroupKeyring::new(generate_group_key());
        let old_msg = keyring.encrypt(b"before rotation").unwrap();

        keyring.rotate();
        let new_msg = keyring.encrypt(b"after rotation").unwrap();

        assert_eq!(&*keyring.decrypt(&old_msg).unwrap(), b"before rotation");
        assert_eq!(&*keyring.decrypt(&new_msg).unwrap(), b"after rotation");
    }

    #[test]
    fn test_kicked_member_cannot_read_new_traffic() {
        let key = generate_group_key();
        let mut router = GroupKeyring::new(key);
        let kicked = GroupKeyring::new(key);

        router.rotate();
        let new_msg = router.encrypt(b"post-kick secret").unwrap();

        // The kicked member still holds only the old key.
        assert!(kicked.decrypt(&new_msg).is_err());

        // But old traffic stays readable for them.
        let old_msg_for_history = GroupKeyring::new(key).encrypt(b"old").unwrap();
        assert_eq!(&*kicked.decrypt(&old_msg_for_history).unwrap(), b"old");
    }

    #[test]
    fn test_history_bounded() {
        let mut keyring = GroupKeyring::new(generate_group_key());
        for _ in 0..20 {
            keyring.rotate();
        }
        assert_eq!(keyring.history_b64().len(), KEY_HISTORY_DEPTH);
    }

    #[test]
    fn test_install_is_idempotent() {
        let mut keyring = GroupKeyring::new(generate_group_key());
        let next = generate_group_key();
        keyring.install(next);
        let depth = keyring.history_b64().len();
        keyring.install(next);
        assert_eq!(keyring.history_b64().len(), depth);
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let router = Identity::generate();
        let member = Identity::generate();
        let router_pair = derive_shared(&router, member.public_key_b64()).unwrap();
        let member_pair = derive_shared(&member, router.public_key_b64()).unwrap();

        let keyring = GroupKeyring::new(generate_group_key());
        let wrapped = keyring.wrap_for(&router_pair).unwrap();
        let unwrapped = unwrap_key(&member_pair, &wrapped).unwrap();
        assert_eq!(&unwrapped, keyring.current());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let mut keyring = GroupKeyring::new(generate_group_key());
        keyring.rotate();
        keyring.rotate();

        let restored =
            GroupKeyring::from_b64(&keyring.current_b64(), &keyring.history_b64()).unwrap();
        assert_eq!(restored.current(), keyring.current());
        assert_eq!(restored.history_b64(), keyring.history_b64());
    }
}
