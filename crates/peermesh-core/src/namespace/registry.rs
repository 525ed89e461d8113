//! Router-side peer registry.
//!
//! Keyed by each peer's discovery address. The registry owns the member
//! channels; everything else holds only the cloneable sender half, which a
//! close invalidates. Entries are evicted after the TTL plus grace without
//! a check-in, and duplicates are resolved by public key — a re-joining
//! peer with a fresh address evicts its stale record.

use crate::protocol::PeerInfo;
use crate::transport::ChannelSender;
use crate::{REGISTRY_TTL_GRACE_SECS, REGISTRY_TTL_SECS};
use std::collections::HashMap;

/// One registered peer plus the router-held connection to it.
#[derive(Debug)]
pub struct RegistryEntry {
    /// Wire-visible registry data.
    pub info: PeerInfo,
    /// Sender half of the member connection (absent for our self-entry).
    pub conn: Option<ChannelSender>,
}

/// The registry of one namespace, as maintained by its router.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
    self_address: Option<String>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register our own entry (the router's).
    pub fn set_self(&mut self, info: PeerInfo) {
        self.self_address = Some(info.address.clone());
        self.entries
            .insert(info.address.clone(), RegistryEntry { info, conn: None });
    }

    /// Our own discovery address, if registered.
    pub fn self_address(&self) -> Option<&str> {
        self.self_address.as_deref()
    }

    /// Apply a member check-in.
    ///
    /// Deduplicates by public key: any *other* entry carrying the same key
    /// is evicted (its connection dropped) before the new entry lands.
    /// Returns the evicted addresses.
    pub fn checkin(&mut self, info: PeerInfo, conn: Option<ChannelSender>) -> Vec<String> {
        let mut evicted = Vec::new();
        if let Some(key) = info.public_key.as_deref() {
            let stale: Vec<String> = self
                .entries
                .iter()
                .filter(|(addr, e)| {
                    **addr != info.address && e.info.public_key.as_deref() == Some(key)
                })
                .map(|(addr, _)| addr.clone())
                .collect();
            for addr in stale {
                if Some(addr.as_str()) == self.self_address.as_deref() {
                    continue;
                }
                self.entries.remove(&addr);
                evicted.push(addr);
            }
        }
        self.entries
            .insert(info.address.clone(), RegistryEntry { info, conn });
        evicted
    }

    /// Refresh the last-seen timestamp of an entry.
    pub fn mark_seen(&mut self, address: &str, now: i64) {
        if let Some(entry) = self.entries.get_mut(address) {
            entry.info.last_seen = now;
        }
    }

    /// Evict entries whose last check-in is older than TTL + grace.
    ///
    /// The self-entry never expires. Returns the evicted addresses.
    pub fn evict_expired(&mut self, now: i64) -> Vec<String> {
        let deadline = REGISTRY_TTL_SECS + REGISTRY_TTL_GRACE_SECS;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(addr, e)| {
                Some(addr.as_str()) != self.self_address.as_deref()
                    && now - e.info.last_seen > deadline
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &expired {
            self.entries.remove(addr);
        }
        expired
    }

    /// Drop the entry bound to a closed connection.
    pub fn remove(&mut self, address: &str) -> Option<RegistryEntry> {
        self.entries.remove(address)
    }

    /// Look up an entry.
    pub fn get(&self, address: &str) -> Option<&RegistryEntry> {
        self.entries.get(address)
    }

    /// The wire-visible snapshot, in stable address order.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.entries.values().map(|e| e.info.clone()).collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Iterate the member connections (everyone but self).
    pub fn member_conns(&self) -> impl Iterator<Item = (&str, &ChannelSender)> {
        self.entries.iter().filter_map(|(addr, e)| {
            e.conn.as_ref().map(|conn| (addr.as_str(), conn))
        })
    }

    /// Number of registered peers, self included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when not even the self-entry is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(address: &str, key: Option<&str>, last_seen: i64) -> PeerInfo {
        PeerInfo {
            address: address.into(),
            name: "peer".into(),
            public_key: key.map(String::from),
            last_seen,
        }
    }

    #[test]
    fn test_checkin_and_snapshot() {
        let mut reg = Registry::new();
        reg.set_self(info("self-addr", Some("pk-self"), 0));
        reg.checkin(info("a", Some("pk-a"), 10), None);
        reg.checkin(info("b", Some("pk-b"), 10), None);

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().any(|p| p.address == "self-addr"));
    }

    #[test]
    fn test_dedup_by_public_key() {
        let mut reg = Registry::new();
        reg.set_self(info("self-addr", None, 0));
        reg.checkin(info("old-addr", Some("pk-x"), 10), None);
        let evicted = reg.checkin(info("new-addr", Some("pk-x"), 20), None);

        assert_eq!(evicted, vec!["old-addr".to_string()]);
        assert!(reg.get("old-addr").is_none());
        assert!(reg.get("new-addr").is_some());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_ttl_eviction_spares_self_and_fresh() {
        let mut reg = Registry::new();
        reg.set_self(info("self-addr", None, 0));
        reg.checkin(info("fresh", None, 1000), None);
        reg.checkin(info("stale", None, 800), None);

        // TTL 90 + grace 10: entries older than 100 s go.
        let evicted = reg.evict_expired(1000 + 1);
        assert!(evicted.is_empty());

        let evicted = reg.evict_expired(800 + 101);
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(reg.get("self-addr").is_some());
        assert!(reg.get("fresh").is_some());
    }

    #[test]
    fn test_mark_seen_refreshes() {
        let mut reg = Registry::new();
        reg.set_self(info("self-addr", None, 0));
        reg.checkin(info("a", None, 100), None);
        reg.mark_seen("a", 500);
        assert!(reg.evict_expired(550).is_empty());
    }

    #[test]
    fn test_checkin_same_address_updates() {
        let mut reg = Registry::new();
        reg.set_self(info("self-addr", None, 0));
        reg.checkin(info("a", Some("pk-a"), 10), None);
        let evicted = reg.checkin(info("a", Some("pk-a"), 99), None);
        assert!(evicted.is_empty());
        assert_eq!(reg.get("a").map(|e| e.info.last_seen), Some(99));
    }
}
