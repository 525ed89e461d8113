//! Contact and chat message data model.
//!
//! Contacts are keyed by fingerprint everywhere; transport addresses are
//! transient attributes. `current_address` is always a member of
//! `known_addresses`, and a contact with `pending = Outgoing` cannot have
//! a shared key yet (the peer never answered, so no key agreement ran).

use crate::protocol::CallKind;
use serde::{Deserialize, Serialize};

/// Handshake state of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PendingState {
    /// Fully established contact.
    #[default]
    None,
    /// We sent a request and wait for the peer to accept.
    Outgoing,
    /// The peer sent a request and waits for us.
    Incoming,
}

/// A remote identity the user has accepted (or is about to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    /// 16-hex-character fingerprint; the map key.
    pub fingerprint: String,
    /// Friendly display name.
    pub name: String,
    /// Base64 identity public key, once known.
    pub public_key: Option<String>,
    /// Last seen transport address.
    pub current_address: Option<String>,
    /// Every transport address this contact was ever seen under.
    #[serde(default)]
    pub known_addresses: Vec<String>,
    /// Cached fingerprint of the derived pairwise key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_key_fp: Option<String>,
    /// Handshake state.
    #[serde(default)]
    pub pending: PendingState,
    /// Unix seconds the contact was last seen online.
    #[serde(default)]
    pub last_seen: i64,
}

impl Contact {
    /// New contact record.
    pub fn new(fingerprint: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            name: name.into(),
            public_key: None,
            current_address: None,
            known_addresses: Vec::new(),
            shared_key_fp: None,
            pending: PendingState::None,
            last_seen: 0,
        }
    }

    /// Record a fresh transport address, keeping `current_address` inside
    /// `known_addresses`.
    pub fn touch_address(&mut self, address: impl Into<String>) {
        let address = address.into();
        if !self.known_addresses.contains(&address) {
            self.known_addresses.push(address.clone());
        }
        self.current_address = Some(address);
    }

    /// Merge another record for the same identity into this one.
    ///
    /// Keeps the newer profile, unions the address history, and is
    /// idempotent: merging the same record twice changes nothing.
    pub fn merge_from(&mut self, other: &Contact) {
        for address in &other.known_addresses {
            if !self.known_addresses.contains(address) {
                self.known_addresses.push(address.clone());
            }
        }
        if other.last_seen >= self.last_seen {
            self.name = other.name.clone();
            if let Some(address) = &other.current_address {
                self.touch_address(address.clone());
            }
            self.last_seen = other.last_seen;
        }
        if self.public_key.is_none() {
            self.public_key = other.public_key.clone();
        }
        if self.shared_key_fp.is_none() {
            self.shared_key_fp = other.shared_key_fp.clone();
        }
        if self.pending != PendingState::None && other.pending == PendingState::None {
            self.pending = PendingState::None;
        }
    }
}

/// Direction of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by us.
    Outgoing,
    /// Sent by the contact.
    Incoming,
}

/// Delivery status of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Queued, not yet on the wire.
    Waiting,
    /// Transmitted, awaiting acknowledgment.
    Sent,
    /// Acknowledged by the recipient.
    Delivered,
    /// Given up after the direct retry budget.
    Failed,
}

/// Payload of a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    /// Plain text.
    Text {
        /// The text.
        body: String,
    },
    /// A transferred file.
    File {
        /// Transfer id keying the blob store.
        tid: String,
        /// File name.
        name: String,
        /// Size in bytes.
        size: u64,
    },
    /// A call log entry.
    CallLog {
        /// Call kind.
        kind: CallKind,
        /// Duration in seconds; zero for missed/rejected calls.
        duration_secs: u64,
    },
}

/// One chat message in a per-contact history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique id within this peer pair.
    pub id: String,
    /// Who sent it.
    pub direction: Direction,
    /// What it carries.
    pub content: MessageContent,
    /// Unix seconds at the sender.
    pub ts: i64,
    /// Delivery status.
    pub status: MessageStatus,
    /// The message was edited after sending.
    #[serde(default)]
    pub edited: bool,
    /// The message was deleted (body cleared, tombstone kept).
    #[serde(default)]
    pub deleted: bool,
    /// When the message last transitioned to `Sent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
}

impl ChatMessage {
    /// New outgoing text message in `Waiting` state.
    pub fn outgoing_text(id: impl Into<String>, body: impl Into<String>, ts: i64) -> Self {
        Self {
            id: id.into(),
            direction: Direction::Outgoing,
            content: MessageContent::Text { body: body.into() },
            ts,
            status: MessageStatus::Waiting,
            edited: false,
            deleted: false,
            sent_at: None,
        }
    }

    /// New incoming message, already delivered by definition.
    pub fn incoming(id: impl Into<String>, content: MessageContent, ts: i64) -> Self {
        Self {
            id: id.into(),
            direction: Direction::Incoming,
            content,
            ts,
            status: MessageStatus::Delivered,
            edited: false,
            deleted: false,
            sent_at: None,
        }
    }

    /// Transition `Waiting → Sent`.
    pub fn mark_sent(&mut self, now: i64) {
        if self.status == MessageStatus::Waiting {
            self.status = MessageStatus::Sent;
            self.sent_at = Some(now);
        }
    }

    /// Transition `Sent → Delivered` on acknowledgment.
    pub fn mark_delivered(&mut self) {
        if self.status == MessageStatus::Sent {
            self.status = MessageStatus::Delivered;
        }
    }

    /// Reset `Sent → Waiting` when no acknowledgment arrived within the
    /// timeout, so the next flush re-sends it. Returns true if reset.
    pub fn reset_if_unacked(&mut self, now: i64, timeout_secs: i64) -> bool {
        if self.status == MessageStatus::Sent {
            if let Some(sent_at) = self.sent_at {
                if now - sent_at >= timeout_secs {
                    self.status = MessageStatus::Waiting;
                    self.sent_at = None;
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_address_invariant() {
        let mut c = Contact::new("00aa11bb22cc33dd", "ada");
        c.touch_address("addr-1");
        c.touch_address("addr-2");
        c.touch_address("addr-1");

        let current = c.current_address.clone().unwrap();
        assert!(c.known_addresses.contains(&current));
        assert_eq!(c.known_addresses.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = Contact::new("00aa11bb22cc33dd", "old name");
        a.touch_address("addr-old");
        a.last_seen = 100;

        let mut b = Contact::new("00aa11bb22cc33dd", "new name");
        b.touch_address("addr-new");
        b.public_key = Some("pk".into());
        b.last_seen = 200;

        a.merge_from(&b);
        let once = a.clone();
        a.merge_from(&b);

        assert_eq!(a.name, once.name);
        assert_eq!(a.known_addresses, once.known_addresses);
        assert_eq!(a.current_address, once.current_address);
        assert_eq!(a.name, "new name");
        assert_eq!(a.current_address.as_deref(), Some("addr-new"));
        assert!(a.known_addresses.contains(&"addr-old".to_string()));
    }

    #[test]
    fn test_merge_keeps_newer_profile() {
        let mut a = Contact::new("00aa11bb22cc33dd", "newer");
        a.last_seen = 500;
        a.touch_address("addr-a");

        let mut b = Contact::new("00aa11bb22cc33dd", "older");
        b.last_seen = 100;
        b.touch_address("addr-b");

        a.merge_from(&b);
        assert_eq!(a.name, "newer");
        assert_eq!(a.current_address.as_deref(), Some("addr-a"));
        assert!(a.known_addresses.contains(&"addr-b".to_string()));
    }

    #[test]
    fn test_status_progression() {
        let mut m = ChatMessage::outgoing_text("m1", "hi", 0);
        assert_eq!(m.status, MessageStatus::Waiting);

        m.mark_sent(10);
        assert_eq!(m.status, MessageStatus::Sent);

        // Delivered is terminal; a later reset does nothing.
        m.mark_delivered();
        assert_eq!(m.status, MessageStatus::Delivered);
        assert!(!m.reset_if_unacked(10_000, 120));
        assert_eq!(m.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_unacked_reset_after_timeout() {
        let mut m = ChatMessage::outgoing_text("m1", "hi", 0);
        m.mark_sent(100);

        assert!(!m.reset_if_unacked(100 + 119, 120));
        assert_eq!(m.status, MessageStatus::Sent);

        assert!(m.reset_if_unacked(100 + 120, 120));
        assert_eq!(m.status, MessageStatus::Waiting);
        assert!(m.sent_at.is_none());
    }

    #[test]
    fn test_delivered_requires_sent() {
        let mut m = ChatMessage::outgoing_text("m1", "hi", 0);
        m.mark_delivered();
        assert_eq!(m.status, MessageStatus::Waiting);
    }
}
