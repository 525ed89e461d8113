//! Persistence layer.
//!
//! The core persists through the narrow [`Store`] trait: a string
//! key-value space plus a blob store for received files. [`MemoryStore`]
//! backs tests and ephemeral runs; [`SqliteStore`] is the durable
//! implementation. [`AppStore`] layers the typed records on top, one
//! method per logical key.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::contact::{ChatMessage, Contact};
use crate::error::Result;
use crate::group::GroupInfo;
use crate::protocol::GroupChatMessage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Metadata stored alongside a received file blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMeta {
    /// Original file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix seconds the transfer completed.
    pub received_at: i64,
}

/// Narrow persistence interface.
pub trait Store: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a value.
    fn put(&self, key: &str, value: &str) -> Result<()>;
    /// Delete a value.
    fn delete(&self, key: &str) -> Result<()>;
    /// Store a file blob under its transfer id.
    fn put_blob(&self, tid: &str, meta: &BlobMeta, bytes: &[u8]) -> Result<()>;
    /// Read a file blob.
    fn get_blob(&self, tid: &str) -> Result<Option<(BlobMeta, Vec<u8>)>>;
    /// Delete a file blob.
    fn delete_blob(&self, tid: &str) -> Result<()>;
}

/// Persisted identity keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedIdentity {
    /// Base64 of the ECDSA secret scalar.
    pub secret_b64: String,
    /// Base64 of the uncompressed public key.
    pub public_b64: String,
}

/// A saved custom namespace the user wants re-joined on startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomNamespaceRecord {
    /// Display name as entered by the user.
    pub name: String,
    /// Slug used in endpoint ids.
    pub slug: String,
    /// Created through the advanced dialog.
    #[serde(default)]
    pub advanced: bool,
    /// User paused this namespace.
    #[serde(default)]
    pub offline: bool,
}

/// Typed view over the logical key layout.
#[derive(Clone)]
pub struct AppStore {
    store: Arc<dyn Store>,
}

impl AppStore {
    /// Wrap a raw store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Access the raw store (blob operations).
    pub fn raw(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store.put(key, &serde_json::to_string(value)?)
    }

    /// Load the persisted identity, if one exists.
    pub fn identity(&self) -> Result<Option<PersistedIdentity>> {
        self.get_json("identity")
    }

    /// Persist the identity keys.
    pub fn save_identity(&self, identity: &PersistedIdentity) -> Result<()> {
        self.put_json("identity", identity)
    }

    /// Decode the persisted secret scalar.
    pub fn identity_secret(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        match self.identity()? {
            Some(id) => {
                let bytes = BASE64
                    .decode(&id.secret_b64)
                    .map_err(|e| crate::Error::Storage(e.to_string()))?;
                Ok(Some(Zeroizing::new(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Current transport address.
    pub fn pid(&self) -> Result<Option<String>> {
        self.store.get("pid")
    }

    /// Save the current transport address and append it to the history.
    pub fn save_pid(&self, pid: &str) -> Result<()> {
        let mut history: Vec<String> = self.get_json("pid-history")?.unwrap_or_default();
        if !history.contains(&pid.to_string()) {
            history.push(pid.to_string());
            self.put_json("pid-history", &history)?;
        }
        self.store.put("pid", pid)
    }

    /// Our persistent discovery uuid, created on first call.
    pub fn discovery_uuid(&self) -> Result<String> {
        if let Some(uuid) = self.store.get("disc-uuid")? {
            return Ok(uuid);
        }
        let uuid = crate::crypto::random_token();
        self.store.put("disc-uuid", &uuid)?;
        Ok(uuid)
    }

    /// The contact map, keyed by fingerprint.
    pub fn contacts(&self) -> Result<HashMap<String, Contact>> {
        Ok(self.get_json("contacts")?.unwrap_or_default())
    }

    /// Persist the contact map.
    pub fn save_contacts(&self, contacts: &HashMap<String, Contact>) -> Result<()> {
        self.put_json("contacts", contacts)
    }

    /// Chat history with a contact.
    pub fn chat(&self, fingerprint: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .get_json(&format!("chats-{fingerprint}"))?
            .unwrap_or_default())
    }

    /// Persist a chat history.
    pub fn save_chat(&self, fingerprint: &str, messages: &[ChatMessage]) -> Result<()> {
        self.put_json(&format!("chats-{fingerprint}"), &messages)
    }

    /// Drop a chat history (contact deletion).
    pub fn delete_chat(&self, fingerprint: &str) -> Result<()> {
        self.store.delete(&format!("chats-{fingerprint}"))
    }

    /// All saved groups.
    pub fn groups(&self) -> Result<Vec<GroupInfo>> {
        Ok(self.get_json("groups")?.unwrap_or_default())
    }

    /// Persist the group list.
    pub fn save_groups(&self, groups: &[GroupInfo]) -> Result<()> {
        self.put_json("groups", &groups)
    }

    /// Stored (still encrypted) messages of a group, for history and
    /// backfill.
    pub fn group_messages(&self, group_id: &str) -> Result<Vec<GroupChatMessage>> {
        Ok(self
            .get_json(&format!("group-msgs-{group_id}"))?
            .unwrap_or_default())
    }

    /// Persist a group's message log.
    pub fn save_group_messages(
        &self,
        group_id: &str,
        messages: &[GroupChatMessage],
    ) -> Result<()> {
        self.put_json(&format!("group-msgs-{group_id}"), &messages)
    }

    /// Drop a group's message log (leave/kick).
    pub fn delete_group_messages(&self, group_id: &str) -> Result<()> {
        self.store.delete(&format!("group-msgs-{group_id}"))
    }

    /// Last-read timestamps per contact.
    pub fn last_read(&self) -> Result<HashMap<String, i64>> {
        Ok(self.get_json("last-read")?.unwrap_or_default())
    }

    /// Persist last-read timestamps per contact.
    pub fn save_last_read(&self, map: &HashMap<String, i64>) -> Result<()> {
        self.put_json("last-read", map)
    }

    /// Last-read timestamps per group.
    pub fn group_last_read(&self) -> Result<HashMap<String, i64>> {
        Ok(self.get_json("group-last-read")?.unwrap_or_default())
    }

    /// Persist last-read timestamps per group.
    pub fn save_group_last_read(&self, map: &HashMap<String, i64>) -> Result<()> {
        self.put_json("group-last-read", map)
    }

    /// Saved custom namespaces.
    pub fn custom_namespaces(&self) -> Result<Vec<CustomNamespaceRecord>> {
        Ok(self.get_json("custom-ns")?.unwrap_or_default())
    }

    /// Persist the custom namespace list.
    pub fn save_custom_namespaces(&self, list: &[CustomNamespaceRecord]) -> Result<()> {
        self.put_json("custom-ns", &list)
    }

    /// User-initiated full offline flag.
    pub fn offline(&self) -> Result<bool> {
        Ok(self.get_json("offline")?.unwrap_or(false))
    }

    /// Persist the full offline flag.
    pub fn save_offline(&self, offline: bool) -> Result<()> {
        self.put_json("offline", &offline)
    }

    /// User-initiated namespace-only offline flag.
    pub fn ns_offline(&self) -> Result<bool> {
        Ok(self.get_json("ns-offline")?.unwrap_or(false))
    }

    /// Persist the namespace-only offline flag.
    pub fn save_ns_offline(&self, offline: bool) -> Result<()> {
        self.put_json("ns-offline", &offline)
    }

    /// One-shot marker that address-keyed records were migrated to
    /// fingerprint keys.
    pub fn fp_migrated(&self) -> Result<bool> {
        Ok(self.get_json("fp-migrated")?.unwrap_or(false))
    }

    /// Set the migration marker.
    pub fn set_fp_migrated(&self) -> Result<()> {
        self.put_json("fp-migrated", &true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_store_roundtrips() {
        let store = AppStore::new(Arc::new(MemoryStore::new()));

        assert!(store.contacts().unwrap().is_empty());
        let mut contacts = HashMap::new();
        contacts.insert(
            "00aa11bb22cc33dd".to_string(),
            Contact::new("00aa11bb22cc33dd", "ada"),
        );
        store.save_contacts(&contacts).unwrap();
        let loaded = store.contacts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["00aa11bb22cc33dd"].name, "ada");
    }

    #[test]
    fn test_discovery_uuid_stable() {
        let store = AppStore::new(Arc::new(MemoryStore::new()));
        let a = store.discovery_uuid().unwrap();
        let b = store.discovery_uuid().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_pid_history_accumulates() {
        let store = AppStore::new(Arc::new(MemoryStore::new()));
        store.save_pid("addr-1").unwrap();
        store.save_pid("addr-2").unwrap();
        store.save_pid("addr-1").unwrap();

        assert_eq!(store.pid().unwrap().as_deref(), Some("addr-1"));
        let history: Vec<String> = serde_json::from_str(
            &store.raw().get("pid-history").unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(history, vec!["addr-1".to_string(), "addr-2".to_string()]);
    }

    #[test]
    fn test_flags_default_false() {
        let store = AppStore::new(Arc::new(MemoryStore::new()));
        assert!(!store.offline().unwrap());
        assert!(!store.ns_offline().unwrap());
        assert!(!store.fp_migrated().unwrap());

        store.set_fp_migrated().unwrap();
        assert!(store.fp_migrated().unwrap());
    }
}
