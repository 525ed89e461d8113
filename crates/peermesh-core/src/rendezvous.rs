//! Per-contact rendezvous slots.
//!
//! For every offline contact with a known public key, both sides derive
//! the same slug from the pairwise key and the current 10-minute window,
//! and run a namespace under it. Whoever claims the router id first waits
//! for the other to join; either way the registry broadcast reveals the
//! peer, a signed address exchange follows over a direct channel, and the
//! slot tears down.
//!
//! The slot map is decision-only state: the manager spawns and shuts down
//! the actual namespace engines, feeding the results back through
//! [`RendezvousManager::register`].

use crate::crypto::{rendezvous_slug, window_index, PairwiseKey};
use crate::namespace::NamespaceHandle;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One active rendezvous attempt.
pub struct RendezvousSlot {
    /// Contact fingerprint this slot hunts for.
    pub fingerprint: String,
    /// Window index the slug was derived in.
    pub window: u64,
    /// The derived slug.
    pub slug: String,
    /// The running namespace.
    pub ns: NamespaceHandle,
}

/// What the sweep decided for one contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Start a rendezvous namespace for this contact.
    Activate {
        /// Contact fingerprint.
        fingerprint: String,
        /// Slug for the namespace ids.
        slug: String,
        /// Window the slug belongs to.
        window: u64,
    },
    /// The window rolled over: the old namespace was shut down, start a
    /// fresh one under the new slug.
    Rotate {
        /// Contact fingerprint.
        fingerprint: String,
        /// New slug.
        slug: String,
        /// New window.
        window: u64,
    },
}

/// Tracks every active rendezvous slot.
#[derive(Default)]
pub struct RendezvousManager {
    active: HashMap<String, RendezvousSlot>,
    answered: HashSet<String>,
}

impl RendezvousManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the slot map against the current offline set.
    ///
    /// `key_for` yields the pairwise key for a fingerprint (None when the
    /// key cannot be derived; such contacts are skipped). Slots for
    /// contacts no longer offline are torn down. Returns the namespaces
    /// the manager must spawn.
    pub fn sweep(
        &mut self,
        now: i64,
        offline: &[String],
        mut key_for: impl FnMut(&str) -> Option<PairwiseKey>,
    ) -> Vec<SweepAction> {
        let window = window_index(now);
        let mut actions = Vec::new();

        // Contacts that reconnected meanwhile lose their slot.
        let offline_set: HashSet<&String> = offline.iter().collect();
        let gone: Vec<String> = self
            .active
            .keys()
            .filter(|fp| !offline_set.contains(fp))
            .cloned()
            .collect();
        for fp in gone {
            self.teardown(&fp);
        }

        for fp in offline {
            let Some(key) = key_for(fp) else {
                continue;
            };
            let slug = rendezvous_slug(&key, window);
            match self.active.get(fp) {
                None => actions.push(SweepAction::Activate {
                    fingerprint: fp.clone(),
                    slug,
                    window,
                }),
                Some(slot) if slot.window != window => {
                    // Both sides rotate on the same wall-clock boundary.
                    debug!(contact = %fp, "rendezvous window rolled over");
                    self.teardown(fp);
                    actions.push(SweepAction::Rotate {
                        fingerprint: fp.clone(),
                        slug,
                        window,
                    });
                }
                Some(_) => {}
            }
        }
        actions
    }

    /// Record the namespace spawned for a sweep action.
    pub fn register(&mut self, fingerprint: impl Into<String>, window: u64, slug: String, ns: NamespaceHandle) {
        let fingerprint = fingerprint.into();
        self.active.insert(
            fingerprint.clone(),
            RendezvousSlot {
                fingerprint,
                window,
                slug,
                ns,
            },
        );
    }

    /// The slot whose namespace carries this label, if any.
    pub fn slot_for_label(&self, label: &str) -> Option<&RendezvousSlot> {
        let slug = label.strip_prefix("rvz:")?;
        self.active.values().find(|s| s.slug == slug)
    }

    /// The slot for a contact, if active.
    pub fn slot(&self, fingerprint: &str) -> Option<&RendezvousSlot> {
        self.active.get(fingerprint)
    }

    /// One exchange answer per slot: true the first time, false after.
    ///
    /// Keeps the responder from answering the caller's answer and
    /// ping-ponging forever.
    pub fn mark_answered(&mut self, fingerprint: &str) -> bool {
        self.answered.insert(fingerprint.to_string())
    }

    /// Shut down and forget a contact's slot (found them, or they came
    /// back on their own).
    pub fn teardown(&mut self, fingerprint: &str) {
        if let Some(slot) = self.active.remove(fingerprint) {
            slot.ns.shutdown();
        }
        self.answered.remove(fingerprint);
    }

    /// Shut down every slot.
    pub fn teardown_all(&mut self) {
        let fps: Vec<String> = self.active.keys().cloned().collect();
        for fp in fps {
            self.teardown(&fp);
        }
    }

    /// Number of active slots.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{self, rendezvous_config, SelfInfo};
    use crate::signaling::SignalingGate;
    use crate::transport::MemoryHub;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn key(byte: u8) -> PairwiseKey {
        PairwiseKey::from_bytes([byte; 32])
    }

    fn spawn_ns(hub: &Arc<MemoryHub>, slug: &str) -> NamespaceHandle {
        let gate = SignalingGate::spawn(hub.clone() as Arc<dyn crate::transport::Reachability>);
        let (tx, _rx) = mpsc::unbounded_channel();
        namespace::spawn(
            rendezvous_config("pmesh", slug),
            SelfInfo {
                discovery_uuid: crate::crypto::random_token(),
                friendly_name: "tester".into(),
                public_key: None,
            },
            Arc::new(hub.transport()),
            gate,
            tx,
        )
    }

    #[tokio::test]
    async fn test_sweep_activates_offline_contacts() {
        let mut rs = RendezvousManager::new();
        let offline = vec!["fp-a".to_string(), "fp-b".to_string()];
        let actions = rs.sweep(1000, &offline, |_| Some(key(1)));

        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|a| matches!(a, SweepAction::Activate { window: 1, .. })));
    }

    #[tokio::test]
    async fn test_sweep_skips_contacts_without_key() {
        let mut rs = RendezvousManager::new();
        let offline = vec!["fp-a".to_string()];
        let actions = rs.sweep(1000, &offline, |_| None);
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn test_active_slot_not_reactivated_within_window() {
        let hub = MemoryHub::new();
        let mut rs = RendezvousManager::new();
        let actions = rs.sweep(1000, &["fp-a".to_string()], |_| Some(key(1)));
        let SweepAction::Activate { slug, window, .. } = actions[0].clone() else {
            panic!("expected activate");
        };
        rs.register("fp-a", window, slug.clone(), spawn_ns(&hub, &slug));

        let again = rs.sweep(1100, &["fp-a".to_string()], |_| Some(key(1)));
        assert!(again.is_empty(), "same window, no action");
    }

    #[tokio::test]
    async fn test_window_rollover_rotates_slug() {
        let hub = MemoryHub::new();
        let mut rs = RendezvousManager::new();
        let actions = rs.sweep(1000, &["fp-a".to_string()], |_| Some(key(1)));
        let SweepAction::Activate { slug, window, .. } = actions[0].clone() else {
            panic!("expected activate");
        };
        rs.register("fp-a", window, slug.clone(), spawn_ns(&hub, &slug));

        // Next window boundary (window width 600 s).
        let actions = rs.sweep(1200, &["fp-a".to_string()], |_| Some(key(1)));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            SweepAction::Rotate {
                slug: new_slug,
                window: new_window,
                ..
            } => {
                assert_ne!(*new_slug, slug);
                assert_eq!(*new_window, 2);
            }
            other => panic!("expected rotate, got {other:?}"),
        }
        assert_eq!(rs.active_count(), 0, "old slot torn down");
    }

    #[tokio::test]
    async fn test_reconnected_contact_slot_torn_down() {
        let hub = MemoryHub::new();
        let mut rs = RendezvousManager::new();
        rs.register("fp-a", 1, "slug-a".into(), spawn_ns(&hub, "slug-a"));
        assert_eq!(rs.active_count(), 1);

        // fp-a is no longer offline.
        let actions = rs.sweep(1000, &[], |_| Some(key(1)));
        assert!(actions.is_empty());
        assert_eq!(rs.active_count(), 0);
    }

    #[tokio::test]
    async fn test_answer_guard_fires_once() {
        let mut rs = RendezvousManager::new();
        assert!(rs.mark_answered("fp-a"));
        assert!(!rs.mark_answered("fp-a"));

        // A fresh slot clears the guard.
        rs.teardown("fp-a");
        assert!(rs.mark_answered("fp-a"));
    }

    #[tokio::test]
    async fn test_slot_label_lookup() {
        let hub = MemoryHub::new();
        let mut rs = RendezvousManager::new();
        rs.register("fp-a", 3, "AbCdEf".into(), spawn_ns(&hub, "AbCdEf"));

        assert_eq!(
            rs.slot_for_label("rvz:AbCdEf").map(|s| s.fingerprint.as_str()),
            Some("fp-a")
        );
        assert!(rs.slot_for_label("rvz:other").is_none());
        assert!(rs.slot_for_label("custom:AbCdEf").is_none());
    }
}
