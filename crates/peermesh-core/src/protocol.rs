//! Wire protocol for all peer-to-peer channels.
//!
//! Every message is a JSON object carrying a string `type` discriminator.
//! The whole protocol is one tagged enum per the transport direction being
//! symmetric; messages are decoded exactly once at the channel edge and
//! handled as typed variants from there on. Unknown types and malformed
//! payloads decode to [`Error::Protocol`] and are silently dropped by the
//! caller.
//!
//! Messages that carry a public key and a signed timestamp are only
//! accepted after signature verification; the sender's transport address
//! alone is never trusted.

use crate::crypto::{self, EncryptedPayload};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Kind of a one-to-one or group call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio-only call.
    Audio,
    /// Audio + camera video.
    Video,
    /// Screen share.
    Screen,
}

/// A peer as it appears in a namespace registry broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's discovery endpoint id.
    pub address: String,
    /// Friendly display name.
    pub name: String,
    /// Base64 identity public key, if the peer shared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Unix seconds of the peer's last check-in at the router.
    pub last_seen: i64,
}

/// Body of a direct chat message: encrypted once a pairwise key exists,
/// plaintext only before E2E is first established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    /// AES-256-GCM payload signed by the sender.
    Encrypted {
        /// The `(iv, ct)` pair.
        #[serde(flatten)]
        payload: EncryptedPayload,
        /// Base64 signature over the ciphertext.
        sig: String,
        /// Marks the payload as end-to-end encrypted.
        e2e: bool,
    },
    /// Plaintext fallback used only while a handshake is still pending.
    Plain {
        /// The message text.
        content: String,
    },
}

/// An encrypted group chat message as relayed by the group router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChatMessage {
    /// Message id, unique within the group.
    pub id: String,
    /// Sender fingerprint.
    pub from_fp: String,
    /// Sender display name at send time.
    pub from_name: String,
    /// Unix seconds at the sender.
    pub ts: i64,
    /// Ciphertext under the group key current at send time.
    #[serde(flatten)]
    pub payload: EncryptedPayload,
    /// Base64 sender signature over the ciphertext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    /// Fingerprints the router has relayed this message to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivered_to: Vec<String>,
}

/// Every message that can travel over a peer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    // --- contact handshake -------------------------------------------------
    /// Ask a peer to become a contact.
    Request {
        /// Requester display name.
        friendly_name: String,
        /// Requester base64 public key.
        public_key: String,
        /// Requester current transport address.
        address: String,
        /// Unix seconds, signed below.
        ts: i64,
        /// Base64 signature over `address|ts`.
        signature: String,
    },
    /// Positive handshake response.
    Accepted {
        /// Accepter transport address.
        address: String,
        /// Accepter discovery uuid.
        discovery_uuid: String,
    },
    /// Negative handshake response.
    Rejected,
    /// Final handshake confirmation from the requester.
    Confirm {
        /// Requester transport address.
        address: String,
        /// Requester display name.
        friendly_name: String,
        /// Requester discovery uuid.
        discovery_uuid: String,
        /// Requester base64 public key.
        public_key: String,
    },

    // --- direct session ----------------------------------------------------
    /// Session opener on a direct channel.
    Hello {
        /// Sender display name.
        friendly_name: String,
        /// Sender base64 public key.
        public_key: String,
        /// Unix seconds, signed below.
        ts: i64,
        /// Base64 signature over `hello|ts`.
        signature: String,
    },
    /// A chat message.
    Message {
        /// Message id, unique per pair.
        id: String,
        /// Unix seconds at the sender.
        ts: i64,
        /// Encrypted or plaintext body.
        #[serde(flatten)]
        body: MessageBody,
    },
    /// Delivery acknowledgment for a chat message.
    MessageAck {
        /// Acknowledged message id.
        id: String,
    },
    /// Edit of an earlier message.
    MessageEdit {
        /// Edited message id.
        id: String,
        /// Replacement body.
        #[serde(flatten)]
        body: MessageBody,
    },
    /// Deletion of an earlier message.
    MessageDelete {
        /// Deleted message id.
        id: String,
        /// Transfer id when the message carried a file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tid: Option<String>,
    },
    /// Display-name change notification.
    NameUpdate {
        /// The new name.
        name: String,
    },

    // --- namespace ---------------------------------------------------------
    /// Member check-in at the namespace router.
    Checkin {
        /// The member's discovery endpoint id.
        discovery_id: String,
        /// Member display name.
        friendly_name: String,
        /// Base64 identity public key, if shared in this namespace.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// Full registry broadcast from the router.
    Registry {
        /// Every registered peer.
        peers: Vec<PeerInfo>,
    },
    /// Router liveness probe.
    Ping,
    /// Member liveness answer.
    Pong,
    /// Router tells members to re-join at another level.
    Migrate {
        /// The level to re-attempt at.
        level: u32,
    },
    /// Router greets a NAT'd peer-slot waiter over a reverse connection.
    ReverseWelcome,

    // --- rendezvous --------------------------------------------------------
    /// Address exchange once two contacts meet in a rendezvous namespace.
    RvzExchange {
        /// Sender current transport address.
        address: String,
        /// Sender display name.
        friendly_name: String,
        /// Sender base64 public key.
        public_key: String,
        /// Unix seconds, signed below.
        ts: i64,
        /// Base64 signature over `address|ts`.
        signature: String,
    },

    // --- direct file transfer ----------------------------------------------
    /// Announce a file transfer.
    FileStart {
        /// Transfer id.
        tid: String,
        /// File name.
        name: String,
        /// Total size in bytes.
        size: u64,
        /// Number of chunks to follow.
        total: u32,
    },
    /// One file chunk (base64 bytes, at most 16 KiB raw).
    FileChunk {
        /// Transfer id.
        tid: String,
        /// Zero-based chunk index.
        index: u32,
        /// Base64 chunk bytes.
        bytes: String,
    },
    /// End of a file transfer.
    FileEnd {
        /// Transfer id.
        tid: String,
    },
    /// Receiver acknowledgment of a completed transfer.
    FileAck {
        /// Transfer id.
        tid: String,
    },

    // --- one-to-one calls --------------------------------------------------
    /// Incoming call notification.
    CallNotify {
        /// Call kind.
        kind: CallKind,
    },
    /// Callee saw the notification (ringing).
    CallReceived {
        /// Call kind.
        kind: CallKind,
    },
    /// Callee answered.
    CallAnswered {
        /// Call kind.
        kind: CallKind,
    },
    /// Callee rejected.
    CallRejected {
        /// Call kind.
        kind: CallKind,
    },

    // --- groups ------------------------------------------------------------
    /// Invitation into a group, with the group key wrapped pairwise.
    GroupInvite {
        /// Group id.
        group_id: String,
        /// Group display name.
        name: String,
        /// Inviter fingerprint.
        inviter_fp: String,
        /// Serialized group info snapshot.
        info: crate::group::GroupInfo,
        /// Current group key encrypted under the inviter/invitee pair key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_key: Option<EncryptedPayload>,
    },
    /// Member check-in at the group router.
    GroupCheckin {
        /// Member fingerprint.
        fp: String,
        /// Member display name.
        name: String,
        /// Member base64 public key.
        public_key: String,
        /// Member current transport address.
        address: String,
        /// Newest group-message timestamp the member already has.
        since_ts: i64,
    },
    /// Member-to-router group message submission.
    GroupMessage {
        /// The encrypted message.
        msg: GroupChatMessage,
    },
    /// Router-to-members relay of a group message.
    GroupRelay {
        /// The encrypted message, ciphertext untouched.
        msg: GroupChatMessage,
    },
    /// Member delivery acknowledgment to the router.
    GroupMessageAck {
        /// Acknowledged message id.
        id: String,
        /// Acknowledging member fingerprint.
        fp: String,
    },
    /// Router relays the accumulated delivery list to the sender.
    GroupAckRelay {
        /// Acknowledged message id.
        id: String,
        /// Fingerprints the message reached.
        delivered_to: Vec<String>,
    },
    /// Member-to-router edit submission.
    GroupEdit {
        /// Replacement message (same id).
        msg: GroupChatMessage,
    },
    /// Router-to-members edit relay.
    GroupEditRelay {
        /// Replacement message (same id).
        msg: GroupChatMessage,
    },
    /// Member-to-router delete submission.
    GroupDelete {
        /// Deleted message id.
        id: String,
        /// Requesting member fingerprint.
        fp: String,
        /// Transfer id when the message carried a file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tid: Option<String>,
    },
    /// Router-to-members delete relay.
    GroupDeleteRelay {
        /// Deleted message id.
        id: String,
        /// Requesting member fingerprint.
        fp: String,
        /// Transfer id when the message carried a file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tid: Option<String>,
    },
    /// Router pushes a refreshed group info snapshot.
    GroupInfoUpdate {
        /// The new snapshot.
        info: crate::group::GroupInfo,
    },
    /// Router backfills messages newer than the member's `since_ts`.
    GroupBackfill {
        /// Messages in router receive order.
        messages: Vec<GroupChatMessage>,
    },
    /// Router hands the current group key to a member, wrapped under the
    /// pairwise key between router and member.
    GroupKeyDistribute {
        /// Distributing router's fingerprint (selects the pairwise key).
        from_fp: String,
        /// Encrypted group key.
        key: EncryptedPayload,
    },
    /// Router distributes a rotated group key, wrapped pairwise.
    GroupKeyRotate {
        /// Distributing router's fingerprint (selects the pairwise key).
        from_fp: String,
        /// Encrypted new group key.
        key: EncryptedPayload,
    },
    /// Admin removed the receiving member from the group.
    GroupKicked,
    /// A member announces leaving the group.
    GroupLeave {
        /// Leaving member fingerprint.
        fp: String,
        /// Leaving member display name.
        name: String,
    },

    // --- group files -------------------------------------------------------
    /// Announce a group file transfer.
    GroupFileStart {
        /// Transfer id.
        tid: String,
        /// File name.
        name: String,
        /// Total size in bytes.
        size: u64,
        /// Number of chunks to follow.
        total_chunks: u32,
        /// Sending member fingerprint.
        fp: String,
    },
    /// One group file chunk.
    GroupFileChunk {
        /// Transfer id.
        tid: String,
        /// Zero-based chunk index.
        index: u32,
        /// Base64 chunk bytes.
        bytes: String,
    },
    /// End of a group file transfer.
    GroupFileEnd {
        /// Transfer id.
        tid: String,
    },

    // --- group calls (signaling only) ---------------------------------------
    /// A member starts a group call.
    GroupCallStart {
        /// Call id.
        call_id: String,
        /// Call kind.
        kind: CallKind,
        /// Starting member fingerprint.
        fp: String,
        /// Starting member display name.
        name: String,
        /// Starting member transport address for media mesh setup.
        address: String,
    },
    /// A member joins the active call.
    GroupCallJoin {
        /// Call id.
        call_id: String,
        /// Joining member fingerprint.
        fp: String,
        /// Joining member display name.
        name: String,
        /// Joining member transport address for media mesh setup.
        address: String,
    },
    /// A member leaves the active call.
    GroupCallLeave {
        /// Call id.
        call_id: String,
        /// Leaving member fingerprint.
        fp: String,
    },
    /// The active call ended.
    GroupCallEnded {
        /// Call id.
        call_id: String,
    },
    /// Opaque media-negotiation signal relayed between two participants.
    GroupCallSignal {
        /// Call id.
        call_id: String,
        /// Media-layer signal discriminator.
        signal_type: String,
        /// Sending participant fingerprint.
        from_fp: String,
        /// Target participant fingerprint.
        to_fp: String,
        /// Media-layer payload, opaque to the core.
        payload: serde_json::Value,
    },
}

impl WireMessage {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Decode a frame received from a channel.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// Canonical byte string signed by messages carrying `address|ts`.
pub fn signed_envelope(address: &str, ts: i64) -> Vec<u8> {
    format!("{address}|{ts}").into_bytes()
}

/// Verify the `address|ts` signature on a handshake or rendezvous message.
pub fn verify_signed_address(
    public_key: &str,
    address: &str,
    ts: i64,
    signature_b64: &str,
) -> Result<()> {
    crypto::verify_b64(public_key, signature_b64, &signed_envelope(address, ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    #[test]
    fn test_tag_is_kebab_case() {
        let msg = WireMessage::MessageAck { id: "m1".into() };
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(json.contains(r#""type":"message-ack""#));

        let msg = WireMessage::ReverseWelcome;
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(json.contains(r#""type":"reverse-welcome""#));
    }

    #[test]
    fn test_roundtrip_registry() {
        let msg = WireMessage::Registry {
            peers: vec![PeerInfo {
                address: "pmesh-10-0-0-1-abc".into(),
                name: "ada".into(),
                public_key: None,
                last_seen: 1000,
            }],
        };
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            WireMessage::Registry { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].name, "ada");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_message_body_untagged_roundtrip() {
        let plain = WireMessage::Message {
            id: "m1".into(),
            ts: 5,
            body: MessageBody::Plain {
                content: "first contact".into(),
            },
        };
        match WireMessage::decode(&plain.encode().unwrap()).unwrap() {
            WireMessage::Message {
                body: MessageBody::Plain { content },
                ..
            } => assert_eq!(content, "first contact"),
            other => panic!("wrong variant: {other:?}"),
        }

        let enc = WireMessage::Message {
            id: "m2".into(),
            ts: 6,
            body: MessageBody::Encrypted {
                payload: EncryptedPayload {
                    iv: "aXY=".into(),
                    ct: "Y3Q=".into(),
                },
                sig: "c2ln".into(),
                e2e: true,
            },
        };
        match WireMessage::decode(&enc.encode().unwrap()).unwrap() {
            WireMessage::Message {
                body: MessageBody::Encrypted { e2e, .. },
                ..
            } => assert!(e2e),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = WireMessage::decode(br#"{"type":"no-such-thing"}"#).unwrap_err();
        assert!(err.should_silent_drop());
    }

    #[test]
    fn test_missing_field_is_protocol_error() {
        let err = WireMessage::decode(br#"{"type":"checkin"}"#).unwrap_err();
        assert!(err.should_silent_drop());
    }

    #[test]
    fn test_signed_address_verification() {
        let id = Identity::generate();
        let sig = id.sign_b64(&signed_envelope("addr-1", 99));
        verify_signed_address(id.public_key_b64(), "addr-1", 99, &sig).expect("verify");
        assert!(verify_signed_address(id.public_key_b64(), "addr-2", 99, &sig).is_err());
        assert!(verify_signed_address(id.public_key_b64(), "addr-1", 100, &sig).is_err());
    }
}
