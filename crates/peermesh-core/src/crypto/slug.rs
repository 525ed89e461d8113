//! Time-rotating rendezvous slug derivation.
//!
//! Two contacts who share a pairwise key derive the same slug for the same
//! 10-minute wall-clock window, so both can claim or join the same
//! rendezvous namespace without exchanging anything. Slugs rotate exactly
//! at window boundaries because both sides floor the same clock.

use crate::crypto::PairwiseKey;
use crate::RENDEZVOUS_WINDOW_SECS;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Number of HMAC bytes kept for the slug (renders to 20 url-safe chars).
const SLUG_BYTES: usize = 15;

/// Length of the rendered slug in characters.
pub const SLUG_LEN: usize = 20;

/// Index of the rendezvous window containing `now_secs`.
pub fn window_index(now_secs: i64) -> u64 {
    (now_secs / RENDEZVOUS_WINDOW_SECS).max(0) as u64
}

/// Derive the rendezvous slug for a pairwise key and window index.
///
/// `HMAC-SHA256(pair_key, window as u64 big-endian)` truncated and encoded
/// url-safe. Both sides of the pair derive identical slugs.
pub fn rendezvous_slug(pair_key: &PairwiseKey, window: u64) -> String {
    // HMAC accepts keys of any length; this cannot fail for a 32-byte key.
    let mut mac = match HmacSha256::new_from_slice(pair_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!(),
    };
    mac.update(&window.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    URL_SAFE_NO_PAD.encode(&digest[..SLUG_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_shared, Identity};

    #[test]
    fn test_slug_symmetry() {
        let a = Identity::generate();
        let b = Identity::generate();
        let k_ab = derive_shared(&a, b.public_key_b64()).expect("derive");
        let k_ba = derive_shared(&b, a.public_key_b64()).expect("derive");

        for window in [0u64, 1, 42, u64::from(u32::MAX)] {
            assert_eq!(rendezvous_slug(&k_ab, window), rendezvous_slug(&k_ba, window));
        }
    }

    #[test]
    fn test_slug_changes_with_window() {
        let key = PairwiseKey::from_bytes([11u8; 32]);
        assert_ne!(rendezvous_slug(&key, 0), rendezvous_slug(&key, 1));
    }

    #[test]
    fn test_slug_shape() {
        let key = PairwiseKey::from_bytes([11u8; 32]);
        let slug = rendezvous_slug(&key, 7);
        assert_eq!(slug.len(), SLUG_LEN);
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_window_boundaries() {
        // Window flips exactly at each 10-minute boundary.
        assert_eq!(window_index(0), 0);
        assert_eq!(window_index(599), 0);
        assert_eq!(window_index(600), 1);
        assert_eq!(window_index(1199), 1);
        assert_eq!(window_index(1200), 2);
    }

    #[test]
    fn test_window_same_for_both_sides() {
        // Both peers floor the same wall clock, so any timestamp within one
        // window maps to the same index.
        let t = 1_700_000_123i64;
        let base = window_index(t);
        assert_eq!(window_index(t + 30), base);
    }
}
