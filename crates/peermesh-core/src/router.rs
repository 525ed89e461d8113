//! Identity router.
//!
//! Presents the messaging API in terms of fingerprints while the transport
//! speaks addresses. Owns the contact map, the address index, per-contact
//! chat histories with their send queues, the pairwise key cache, and the
//! per-contact connection state. The core manager task is the single owner
//! of this state; nothing here is shared.

use crate::contact::{ChatMessage, Contact, Direction, MessageContent, MessageStatus, PendingState};
use crate::crypto::{self, derive_shared, Identity, PairwiseKey};
use crate::error::{Error, Result};
use crate::events::{EventBus, MessageEvent, StatusEvent};
use crate::protocol::{MessageBody, WireMessage};
use crate::transport::ChannelSender;
use crate::{ACK_TIMEOUT_SECS, MAX_CONNECT_RETRIES};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Contacts the sweeper reconnects per pass.
const SWEEP_BATCH: usize = 3;

/// The fingerprint-keyed routing core.
pub struct IdentityRouter {
    contacts: HashMap<String, Contact>,
    chats: HashMap<String, Vec<ChatMessage>>,
    address_index: HashMap<String, String>,
    connections: HashMap<String, ChannelSender>,
    inflight: HashSet<String>,
    failures: HashMap<String, u32>,
    shared_keys: HashMap<String, PairwiseKey>,
    bus: EventBus,
}

impl IdentityRouter {
    /// Empty router.
    pub fn new(bus: EventBus) -> Self {
        Self {
            contacts: HashMap::new(),
            chats: HashMap::new(),
            address_index: HashMap::new(),
            connections: HashMap::new(),
            inflight: HashSet::new(),
            failures: HashMap::new(),
            shared_keys: HashMap::new(),
            bus,
        }
    }

    /// Restore from persisted contacts and chats.
    pub fn load(
        contacts: HashMap<String, Contact>,
        chats: HashMap<String, Vec<ChatMessage>>,
        bus: EventBus,
    ) -> Self {
        let mut router = Self::new(bus);
        for (fp, contact) in &contacts {
            for address in &contact.known_addresses {
                router.address_index.insert(address.clone(), fp.clone());
            }
        }
        router.contacts = contacts;
        router.chats = chats;
        router
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    /// Look up a contact by fingerprint.
    pub fn contact(&self, fingerprint: &str) -> Option<&Contact> {
        self.contacts.get(fingerprint)
    }

    /// Mutable contact access.
    pub fn contact_mut(&mut self, fingerprint: &str) -> Option<&mut Contact> {
        self.contacts.get_mut(fingerprint)
    }

    /// All contacts, for persistence.
    pub fn contacts(&self) -> &HashMap<String, Contact> {
        &self.contacts
    }

    /// Chat history with a contact.
    pub fn chat(&self, fingerprint: &str) -> &[ChatMessage] {
        self.chats
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All chats, for persistence.
    pub fn chats(&self) -> &HashMap<String, Vec<ChatMessage>> {
        &self.chats
    }

    /// Resolve a transport address to a fingerprint.
    pub fn fingerprint_for_address(&self, address: &str) -> Option<&str> {
        self.address_index.get(address).map(String::as_str)
    }

    /// Insert or update a contact, maintaining the address index.
    pub fn upsert_contact(&mut self, contact: Contact) {
        for address in &contact.known_addresses {
            self.address_index
                .insert(address.clone(), contact.fingerprint.clone());
        }
        self.contacts.insert(contact.fingerprint.clone(), contact);
    }

    /// Delete a contact and everything keyed by it.
    pub fn remove_contact(&mut self, fingerprint: &str) -> Option<Contact> {
        let contact = self.contacts.remove(fingerprint)?;
        for address in &contact.known_addresses {
            self.address_index.remove(address);
        }
        self.chats.remove(fingerprint);
        self.connections.remove(fingerprint);
        self.shared_keys.remove(fingerprint);
        self.failures.remove(fingerprint);
        Some(contact)
    }

    /// Record a fresh address for a contact.
    pub fn touch_address(&mut self, fingerprint: &str, address: &str, now: i64) {
        if let Some(contact) = self.contacts.get_mut(fingerprint) {
            contact.touch_address(address);
            contact.last_seen = now;
            self.address_index
                .insert(address.to_string(), fingerprint.to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Address-change migration
    // -----------------------------------------------------------------------

    /// Merge records when a verified public key shows up under a new
    /// transport address.
    ///
    /// `old_key` is whatever record key the traffic was previously filed
    /// under (an address-keyed legacy record or a stale fingerprint). The
    /// merge unions address history and chat history (deduplicated by
    /// message id), keeps the newer profile, and is idempotent.
    /// Returns the surviving fingerprint.
    pub fn migrate(
        &mut self,
        old_key: &str,
        verified_public_key: &str,
        address: &str,
        now: i64,
    ) -> Result<String> {
        let fingerprint = crypto::fingerprint_of(verified_public_key)?;

        if old_key != fingerprint {
            if let Some(old_record) = self.contacts.remove(old_key) {
                let mut target = self
                    .contacts
                    .remove(&fingerprint)
                    .unwrap_or_else(|| Contact::new(fingerprint.clone(), old_record.name.clone()));
                target.merge_from(&old_record);

                let old_chat = self.chats.remove(old_key).unwrap_or_default();
                let target_chat = self.chats.entry(fingerprint.clone()).or_default();
                for msg in old_chat {
                    if !target_chat.iter().any(|m| m.id == msg.id) {
                        target_chat.push(msg);
                    }
                }
                target_chat.sort_by_key(|m| m.ts);

                for known in &old_record.known_addresses {
                    self.address_index
                        .insert(known.clone(), fingerprint.clone());
                }
                self.contacts.insert(fingerprint.clone(), target);

                info!(old = %old_key, new = %fingerprint, "migrated contact record");
                self.bus.status(StatusEvent::ContactMigrated {
                    old_key: old_key.to_string(),
                    fingerprint: fingerprint.clone(),
                });
            }
        }

        let contact = self
            .contacts
            .entry(fingerprint.clone())
            .or_insert_with(|| Contact::new(fingerprint.clone(), fingerprint.clone()));
        contact.public_key = Some(verified_public_key.to_string());
        contact.last_seen = now;
        if !address.is_empty() {
            contact.touch_address(address);
            self.address_index
                .insert(address.to_string(), fingerprint.clone());
        }

        Ok(fingerprint)
    }

    // -----------------------------------------------------------------------
    // Pairwise key cache
    // -----------------------------------------------------------------------

    /// The cached pairwise key for a contact, derived once.
    ///
    /// The key fingerprint lands on the contact record so restarts can
    /// detect a mismatch without re-deriving.
    pub fn shared_key(&mut self, identity: &Identity, fingerprint: &str) -> Result<PairwiseKey> {
        if let Some(key) = self.shared_keys.get(fingerprint) {
            return Ok(key.clone());
        }
        let contact = self
            .contacts
            .get_mut(fingerprint)
            .ok_or_else(|| Error::NotFound(format!("contact {fingerprint}")))?;
        let public_key = contact
            .public_key
            .clone()
            .ok_or_else(|| Error::KeyDerive("contact has no public key yet".into()))?;
        let key = derive_shared(identity, &public_key)?;
        contact.shared_key_fp = Some(key.fingerprint());
        self.shared_keys.insert(fingerprint.to_string(), key.clone());
        Ok(key)
    }

    /// Drop a cached key (explicit clear only).
    pub fn clear_shared_key(&mut self, fingerprint: &str) {
        self.shared_keys.remove(fingerprint);
        if let Some(contact) = self.contacts.get_mut(fingerprint) {
            contact.shared_key_fp = None;
        }
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Queue a text message and flush it if a channel is open.
    ///
    /// Returns the message id. When no channel exists the message stays
    /// `Waiting` and the caller should trigger a connect.
    pub fn send_text(
        &mut self,
        identity: &Identity,
        fingerprint: &str,
        text: impl Into<String>,
        now: i64,
    ) -> Result<String> {
        if !self.contacts.contains_key(fingerprint) {
            return Err(Error::NotFound(format!("contact {fingerprint}")));
        }
        let msg = ChatMessage::outgoing_text(crypto::random_token(), text, now);
        let id = msg.id.clone();
        self.chats
            .entry(fingerprint.to_string())
            .or_default()
            .push(msg);

        if self.connections.contains_key(fingerprint) {
            self.flush(identity, fingerprint, now);
        }
        Ok(id)
    }

    /// Whether a direct channel to the contact is open.
    pub fn is_connected(&self, fingerprint: &str) -> bool {
        self.connections
            .get(fingerprint)
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    /// The open channel to a contact, if any.
    pub fn connection(&self, fingerprint: &str) -> Option<ChannelSender> {
        self.connections
            .get(fingerprint)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Record an outgoing file transfer in the chat history.
    pub fn record_outgoing_file(
        &mut self,
        fingerprint: &str,
        tid: &str,
        name: &str,
        size: u64,
        now: i64,
    ) {
        let mut msg = ChatMessage {
            id: tid.to_string(),
            direction: Direction::Outgoing,
            content: MessageContent::File {
                tid: tid.to_string(),
                name: name.to_string(),
                size,
            },
            ts: now,
            status: MessageStatus::Waiting,
            edited: false,
            deleted: false,
            sent_at: None,
        };
        msg.mark_sent(now);
        self.chats
            .entry(fingerprint.to_string())
            .or_default()
            .push(msg);
    }

    /// Register an open channel and flush the queue in insertion order.
    pub fn register_connection(
        &mut self,
        identity: &Identity,
        fingerprint: &str,
        sender: ChannelSender,
        now: i64,
    ) {
        self.connections.insert(fingerprint.to_string(), sender);
        self.inflight.remove(fingerprint);
        self.failures.remove(fingerprint);
        if let Some(contact) = self.contacts.get_mut(fingerprint) {
            contact.last_seen = now;
        }
        self.bus.status(StatusEvent::ContactOnline {
            fingerprint: fingerprint.to_string(),
        });
        self.flush(identity, fingerprint, now);
    }

    /// Drop a closed channel.
    pub fn connection_closed(&mut self, fingerprint: &str) {
        if self.connections.remove(fingerprint).is_some() {
            self.bus.status(StatusEvent::ContactOffline {
                fingerprint: fingerprint.to_string(),
            });
        }
    }

    /// Flush every `Waiting` message to the open channel, oldest first.
    pub fn flush(&mut self, identity: &Identity, fingerprint: &str, now: i64) {
        let Some(conn) = self.connections.get(fingerprint).cloned() else {
            return;
        };
        // E2E once a key exists; plaintext only before the first handshake
        // completes.
        let key = self.shared_key(identity, fingerprint).ok();

        let Some(chat) = self.chats.get_mut(fingerprint) else {
            return;
        };
        for msg in chat.iter_mut() {
            if msg.direction != Direction::Outgoing || msg.status != MessageStatus::Waiting {
                continue;
            }
            let body = match (&key, &msg.content) {
                (Some(key), content) => {
                    let plain = match serde_json::to_vec(content) {
                        Ok(plain) => plain,
                        Err(_) => continue,
                    };
                    match crypto::encrypt(key.as_bytes(), &plain) {
                        Ok(payload) => {
                            let sig = identity.sign_b64(payload.ct.as_bytes());
                            MessageBody::Encrypted {
                                payload,
                                sig,
                                e2e: true,
                            }
                        }
                        Err(e) => {
                            warn!(contact = %fingerprint, "encrypt failed: {e}");
                            continue;
                        }
                    }
                }
                (None, MessageContent::Text { body }) => MessageBody::Plain {
                    content: body.clone(),
                },
                (None, _) => {
                    // Files and call logs never fall back to plaintext.
                    continue;
                }
            };
            let wire = WireMessage::Message {
                id: msg.id.clone(),
                ts: msg.ts,
                body,
            };
            match wire.encode() {
                Ok(bytes) => {
                    if conn.send(bytes).is_err() {
                        debug!(contact = %fingerprint, "channel closed mid-flush");
                        break;
                    }
                    msg.mark_sent(now);
                    self.bus.message(MessageEvent::StatusChanged {
                        fingerprint: fingerprint.to_string(),
                        id: msg.id.clone(),
                        status: MessageStatus::Sent,
                    });
                }
                Err(e) => warn!(contact = %fingerprint, "encode failed: {e}"),
            }
        }
    }

    /// Record a delivery acknowledgment.
    pub fn handle_ack(&mut self, fingerprint: &str, id: &str) {
        if let Some(chat) = self.chats.get_mut(fingerprint) {
            if let Some(msg) = chat.iter_mut().find(|m| m.id == id) {
                msg.mark_delivered();
                self.bus.message(MessageEvent::StatusChanged {
                    fingerprint: fingerprint.to_string(),
                    id: id.to_string(),
                    status: MessageStatus::Delivered,
                });
            }
        }
    }

    /// Store an incoming message (idempotent by id). Returns the stored
    /// message if it was new.
    pub fn store_incoming(
        &mut self,
        fingerprint: &str,
        id: &str,
        content: MessageContent,
        ts: i64,
    ) -> Option<ChatMessage> {
        let chat = self.chats.entry(fingerprint.to_string()).or_default();
        if chat.iter().any(|m| m.id == id) {
            return None;
        }
        let msg = ChatMessage::incoming(id, content, ts);
        chat.push(msg.clone());
        self.bus.message(MessageEvent::Received {
            fingerprint: fingerprint.to_string(),
            message: msg.clone(),
        });
        Some(msg)
    }

    /// Edit one of our own messages and push the edit to the contact.
    ///
    /// Local history updates regardless; the wire edit goes out only over
    /// an open channel (edits are not queued).
    pub fn send_edit(
        &mut self,
        identity: &Identity,
        fingerprint: &str,
        id: &str,
        new_text: impl Into<String>,
    ) -> Result<()> {
        let new_text = new_text.into();
        let chat = self
            .chats
            .get_mut(fingerprint)
            .ok_or_else(|| Error::NotFound(format!("chat {fingerprint}")))?;
        let msg = chat
            .iter_mut()
            .find(|m| m.id == id && m.direction == Direction::Outgoing)
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        msg.content = MessageContent::Text {
            body: new_text.clone(),
        };
        msg.edited = true;
        self.bus.message(MessageEvent::Edited {
            fingerprint: fingerprint.to_string(),
            id: id.to_string(),
        });

        let Some(conn) = self.connections.get(fingerprint).cloned() else {
            return Ok(());
        };
        let key = self.shared_key(identity, fingerprint)?;
        let payload = crypto::encrypt(
            key.as_bytes(),
            &serde_json::to_vec(&MessageContent::Text { body: new_text })?,
        )?;
        let sig = identity.sign_b64(payload.ct.as_bytes());
        let wire = WireMessage::MessageEdit {
            id: id.to_string(),
            body: MessageBody::Encrypted {
                payload,
                sig,
                e2e: true,
            },
        };
        let _ = conn.send(wire.encode()?);
        Ok(())
    }

    /// Delete one of our own messages (tombstone locally, notify the
    /// contact). Returns the transfer id if the message carried a file.
    pub fn send_delete(&mut self, fingerprint: &str, id: &str) -> Result<Option<String>> {
        let chat = self
            .chats
            .get_mut(fingerprint)
            .ok_or_else(|| Error::NotFound(format!("chat {fingerprint}")))?;
        let msg = chat
            .iter_mut()
            .find(|m| m.id == id && m.direction == Direction::Outgoing)
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        let tid = match &msg.content {
            MessageContent::File { tid, .. } => Some(tid.clone()),
            _ => None,
        };
        msg.deleted = true;
        msg.content = MessageContent::Text { body: String::new() };
        self.bus.message(MessageEvent::Deleted {
            fingerprint: fingerprint.to_string(),
            id: id.to_string(),
        });

        if let Some(conn) = self.connections.get(fingerprint) {
            let wire = WireMessage::MessageDelete {
                id: id.to_string(),
                tid: tid.clone(),
            };
            if let Ok(bytes) = wire.encode() {
                let _ = conn.send(bytes);
            }
        }
        Ok(tid)
    }

    /// Apply an edit received from the contact.
    pub fn apply_edit(&mut self, fingerprint: &str, id: &str, content: MessageContent) {
        if let Some(chat) = self.chats.get_mut(fingerprint) {
            if let Some(msg) = chat
                .iter_mut()
                .find(|m| m.id == id && m.direction == Direction::Incoming)
            {
                msg.content = content;
                msg.edited = true;
                self.bus.message(MessageEvent::Edited {
                    fingerprint: fingerprint.to_string(),
                    id: id.to_string(),
                });
            }
        }
    }

    /// Apply a deletion received from the contact.
    pub fn apply_delete(&mut self, fingerprint: &str, id: &str) {
        if let Some(chat) = self.chats.get_mut(fingerprint) {
            if let Some(msg) = chat
                .iter_mut()
                .find(|m| m.id == id && m.direction == Direction::Incoming)
            {
                msg.deleted = true;
                msg.content = MessageContent::Text { body: String::new() };
                self.bus.message(MessageEvent::Deleted {
                    fingerprint: fingerprint.to_string(),
                    id: id.to_string(),
                });
            }
        }
    }

    /// Reset unacknowledged `Sent` messages back to `Waiting`.
    ///
    /// Returns the contacts that now have queued traffic again.
    pub fn ack_sweep(&mut self, now: i64) -> Vec<String> {
        let mut stale = Vec::new();
        for (fp, chat) in self.chats.iter_mut() {
            let mut any = false;
            for msg in chat.iter_mut() {
                if msg.reset_if_unacked(now, ACK_TIMEOUT_SECS) {
                    any = true;
                }
            }
            if any {
                stale.push(fp.clone());
            }
        }
        stale
    }

    // -----------------------------------------------------------------------
    // Connect bookkeeping
    // -----------------------------------------------------------------------

    /// Mark a connect attempt as started. False if one is already running.
    pub fn begin_connect(&mut self, fingerprint: &str) -> bool {
        self.inflight.insert(fingerprint.to_string())
    }

    /// A connect attempt failed. Returns true once the retry budget is
    /// exhausted: queued messages flip to `Failed` and the caller enrolls
    /// the contact in the rendezvous subsystem.
    pub fn connect_failed(&mut self, fingerprint: &str) -> bool {
        self.inflight.remove(fingerprint);
        let failures = self.failures.entry(fingerprint.to_string()).or_insert(0);
        *failures += 1;
        if *failures < MAX_CONNECT_RETRIES {
            return false;
        }
        self.failures.remove(fingerprint);

        if let Some(chat) = self.chats.get_mut(fingerprint) {
            for msg in chat.iter_mut() {
                if msg.direction == Direction::Outgoing && msg.status == MessageStatus::Waiting {
                    msg.status = MessageStatus::Failed;
                    self.bus.message(MessageEvent::StatusChanged {
                        fingerprint: fingerprint.to_string(),
                        id: msg.id.clone(),
                        status: MessageStatus::Failed,
                    });
                }
            }
        }
        self.bus.status(StatusEvent::ContactUnreachable {
            fingerprint: fingerprint.to_string(),
        });
        true
    }

    /// Saved contacts worth a periodic reconnect attempt: offline, not
    /// already being connected, with a known address. At most
    /// [`SWEEP_BATCH`] per pass.
    pub fn sweep_candidates(&self) -> Vec<(String, String)> {
        self.contacts
            .values()
            .filter(|c| {
                c.pending == PendingState::None
                    && !self.connections.contains_key(&c.fingerprint)
                    && !self.inflight.contains(&c.fingerprint)
            })
            .filter_map(|c| {
                c.current_address
                    .as_ref()
                    .map(|a| (c.fingerprint.clone(), a.clone()))
            })
            .take(SWEEP_BATCH)
            .collect()
    }

    /// Offline contacts with a public key: the rendezvous working set.
    pub fn rendezvous_candidates(&self) -> Vec<String> {
        self.contacts
            .values()
            .filter(|c| {
                c.pending == PendingState::None
                    && c.public_key.is_some()
                    && !self.connections.contains_key(&c.fingerprint)
            })
            .map(|c| c.fingerprint.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    fn setup() -> (IdentityRouter, Identity) {
        (IdentityRouter::new(EventBus::new(64)), Identity::generate())
    }

    fn saved_contact(router: &mut IdentityRouter, peer: &Identity, name: &str) -> String {
        let fp = peer.fingerprint().to_string();
        let mut contact = Contact::new(fp.clone(), name);
        contact.public_key = Some(peer.public_key_b64().to_string());
        contact.touch_address(format!("addr-{name}"));
        router.upsert_contact(contact);
        fp
    }

    #[tokio::test]
    async fn test_queue_flushes_in_order_on_connect() {
        let (mut router, me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");

        let id1 = router.send_text(&me, &fp, "first", 1).unwrap();
        let id2 = router.send_text(&me, &fp, "second", 2).unwrap();
        assert!(router
            .chat(&fp)
            .iter()
            .all(|m| m.status == MessageStatus::Waiting));

        let (ours, mut theirs) = channel_pair();
        router.register_connection(&me, &fp, ours.sender(), 10);

        let mut ids = Vec::new();
        while let Ok(Some(bytes)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), theirs.recv()).await
        {
            match WireMessage::decode(&bytes).unwrap() {
                WireMessage::Message { id, body, .. } => {
                    assert!(matches!(body, MessageBody::Encrypted { e2e: true, .. }));
                    ids.push(id);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(ids, vec![id1.clone(), id2.clone()]);
        assert!(router
            .chat(&fp)
            .iter()
            .all(|m| m.status == MessageStatus::Sent));

        router.handle_ack(&fp, &id1);
        assert_eq!(router.chat(&fp)[0].status, MessageStatus::Delivered);
        assert_eq!(router.chat(&fp)[1].status, MessageStatus::Sent);
        let _ = id2;
    }

    #[tokio::test]
    async fn test_encrypted_flush_decryptable_by_peer() {
        let (mut router, me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");

        router.send_text(&me, &fp, "secret hello", 1).unwrap();
        let (ours, mut theirs) = channel_pair();
        router.register_connection(&me, &fp, ours.sender(), 10);

        let bytes = theirs.recv().await.unwrap();
        let WireMessage::Message { body, .. } = WireMessage::decode(&bytes).unwrap() else {
            panic!("not a message");
        };
        let MessageBody::Encrypted { payload, sig, .. } = body else {
            panic!("not encrypted");
        };

        // Peer verifies our signature and decrypts with the pairwise key.
        crypto::verify_b64(me.public_key_b64(), &sig, payload.ct.as_bytes()).unwrap();
        let pair = derive_shared(&peer, me.public_key_b64()).unwrap();
        let plain = crypto::decrypt(pair.as_bytes(), &payload).unwrap();
        let content: MessageContent = serde_json::from_slice(&plain).unwrap();
        assert!(matches!(content, MessageContent::Text { body } if body == "secret hello"));
    }

    #[test]
    fn test_plaintext_fallback_only_without_key() {
        let (mut router, me) = setup();
        let mut contact = Contact::new("feedfacecafebeef", "pending");
        contact.pending = PendingState::Outgoing;
        router.upsert_contact(contact);

        router
            .send_text(&me, "feedfacecafebeef", "first contact", 1)
            .unwrap();
        let (ours, _theirs) = channel_pair();
        router.register_connection(&me, "feedfacecafebeef", ours.sender(), 2);
        // No key, no crash: the message went plaintext.
        assert_eq!(
            router.chat("feedfacecafebeef")[0].status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn test_ack_sweep_resets_stale_sent() {
        let (mut router, me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");

        router.send_text(&me, &fp, "will stall", 1).unwrap();
        let (ours, theirs) = channel_pair();
        router.register_connection(&me, &fp, ours.sender(), 100);
        drop(theirs);
        assert_eq!(router.chat(&fp)[0].status, MessageStatus::Sent);

        assert!(router.ack_sweep(100 + ACK_TIMEOUT_SECS - 1).is_empty());
        let stale = router.ack_sweep(100 + ACK_TIMEOUT_SECS);
        assert_eq!(stale, vec![fp.clone()]);
        assert_eq!(router.chat(&fp)[0].status, MessageStatus::Waiting);
    }

    #[test]
    fn test_migration_merges_and_is_idempotent() {
        let (mut router, _me) = setup();
        let peer = Identity::generate();
        let fp = peer.fingerprint().to_string();

        // Legacy record keyed by address, with history.
        let mut legacy = Contact::new("legacy-addr-1", "ada (old)");
        legacy.touch_address("legacy-addr-1");
        legacy.last_seen = 50;
        router.upsert_contact(legacy);
        router.chats.insert(
            "legacy-addr-1".to_string(),
            vec![ChatMessage::outgoing_text("m1", "old history", 40)],
        );

        let survivor = router
            .migrate("legacy-addr-1", peer.public_key_b64(), "new-addr", 100)
            .unwrap();
        assert_eq!(survivor, fp);
        assert!(router.contact("legacy-addr-1").is_none());

        let merged = router.contact(&fp).unwrap();
        assert!(merged.known_addresses.contains(&"legacy-addr-1".to_string()));
        assert_eq!(merged.current_address.as_deref(), Some("new-addr"));
        assert_eq!(router.chat(&fp).len(), 1);

        // Second run is a no-op.
        let again = router
            .migrate("legacy-addr-1", peer.public_key_b64(), "new-addr", 101)
            .unwrap();
        assert_eq!(again, fp);
        assert_eq!(router.chat(&fp).len(), 1);
        assert_eq!(
            router.contact(&fp).unwrap().known_addresses.len(),
            2
        );
    }

    #[test]
    fn test_shared_key_cached_and_fingerprinted() {
        let (mut router, me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");

        let k1 = router.shared_key(&me, &fp).unwrap();
        let k2 = router.shared_key(&me, &fp).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(
            router.contact(&fp).unwrap().shared_key_fp.as_deref(),
            Some(k1.fingerprint().as_str())
        );

        // Matches the peer's own derivation.
        let peer_key = derive_shared(&peer, me.public_key_b64()).unwrap();
        assert_eq!(k1.as_bytes(), peer_key.as_bytes());
    }

    #[test]
    fn test_connect_failure_budget() {
        let (mut router, me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");
        router.send_text(&me, &fp, "doomed", 1).unwrap();

        assert!(router.begin_connect(&fp));
        assert!(!router.connect_failed(&fp));
        assert!(router.begin_connect(&fp));
        assert!(!router.connect_failed(&fp));
        assert!(router.begin_connect(&fp));
        assert!(router.connect_failed(&fp), "third failure exhausts budget");

        assert_eq!(router.chat(&fp)[0].status, MessageStatus::Failed);
        assert!(router.rendezvous_candidates().contains(&fp));
    }

    #[test]
    fn test_sweep_candidates_excludes_connected_and_inflight() {
        let (mut router, _me) = setup();
        let a = Identity::generate();
        let b = Identity::generate();
        let c = Identity::generate();
        let fp_a = saved_contact(&mut router, &a, "a");
        let fp_b = saved_contact(&mut router, &b, "b");
        let fp_c = saved_contact(&mut router, &c, "c");

        let (conn, _rx) = channel_pair();
        router.connections.insert(fp_a.clone(), conn.sender());
        router.begin_connect(&fp_b);

        let candidates: Vec<String> =
            router.sweep_candidates().into_iter().map(|(fp, _)| fp).collect();
        assert!(!candidates.contains(&fp_a));
        assert!(!candidates.contains(&fp_b));
        assert!(candidates.contains(&fp_c));
    }

    #[tokio::test]
    async fn test_edit_and_delete_own_messages() {
        let (mut router, me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");

        let (ours, mut theirs) = channel_pair();
        router.register_connection(&me, &fp, ours.sender(), 10);
        let id = router.send_text(&me, &fp, "tpyo", 11).unwrap();
        let _ = theirs.recv().await.unwrap();

        router.send_edit(&me, &fp, &id, "typo").unwrap();
        let bytes = theirs.recv().await.unwrap();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::MessageEdit { id: edited, .. } => assert_eq!(edited, id),
            other => panic!("expected edit, got {other:?}"),
        }
        assert!(router.chat(&fp)[0].edited);

        router.send_delete(&fp, &id).unwrap();
        let bytes = theirs.recv().await.unwrap();
        assert!(matches!(
            WireMessage::decode(&bytes).unwrap(),
            WireMessage::MessageDelete { .. }
        ));
        assert!(router.chat(&fp)[0].deleted);

        // Editing a message that is not ours fails.
        router.store_incoming(&fp, "in-1", MessageContent::Text { body: "hi".into() }, 12);
        assert!(router.send_edit(&me, &fp, "in-1", "nope").is_err());
    }

    #[test]
    fn test_store_incoming_deduplicates() {
        let (mut router, _me) = setup();
        let peer = Identity::generate();
        let fp = saved_contact(&mut router, &peer, "ada");

        let content = MessageContent::Text { body: "hi".into() };
        assert!(router.store_incoming(&fp, "m1", content.clone(), 5).is_some());
        assert!(router.store_incoming(&fp, "m1", content, 5).is_none());
        assert_eq!(router.chat(&fp).len(), 1);
    }
}
