//! Typed event families.
//!
//! External observers (UI layers) receive immutable snapshots over
//! broadcast channels, one per event family. Observers never mutate core
//! state; a lagging subscriber only loses its own backlog.

use crate::contact::{ChatMessage, MessageStatus};
use crate::group::GroupInfo;
use crate::namespace::Role;
use crate::protocol::{CallKind, PeerInfo};
use tokio::sync::broadcast;

/// Connectivity and contact lifecycle events.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// The overlay is up under the given transport address.
    Started {
        /// Our transport address.
        address: String,
        /// Our fingerprint.
        fingerprint: String,
    },
    /// The overlay shut down.
    Stopped,
    /// A saved contact was seen on a namespace or direct channel.
    ContactOnline {
        /// The contact's fingerprint.
        fingerprint: String,
    },
    /// A saved contact went offline.
    ContactOffline {
        /// The contact's fingerprint.
        fingerprint: String,
    },
    /// Two records for the same identity were merged.
    ContactMigrated {
        /// Key of the record that was absorbed.
        old_key: String,
        /// Surviving fingerprint.
        fingerprint: String,
    },
    /// Direct attempts exhausted; the contact moved to rendezvous.
    ContactUnreachable {
        /// The contact's fingerprint.
        fingerprint: String,
    },
    /// The signaling gate is backing off.
    SignalingThrottled {
        /// Current emission interval.
        interval_ms: u64,
    },
    /// The network is unreachable; discovery is paused.
    NetworkDown,
    /// The network recovered.
    NetworkUp,
    /// A namespace changed role or level.
    Namespace {
        /// Namespace label.
        label: String,
        /// New role.
        role: Role,
        /// New level.
        level: u32,
    },
    /// An unknown peer surfaced in a namespace registry.
    DiscoveryCandidate {
        /// Namespace label it appeared in.
        label: String,
        /// The peer.
        peer: PeerInfo,
    },
}

/// Direct chat events.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// A message arrived.
    Received {
        /// Sender fingerprint.
        fingerprint: String,
        /// The stored message.
        message: ChatMessage,
    },
    /// An outgoing message changed delivery status.
    StatusChanged {
        /// Recipient fingerprint.
        fingerprint: String,
        /// Message id.
        id: String,
        /// New status.
        status: MessageStatus,
    },
    /// A message was edited by its sender.
    Edited {
        /// Contact fingerprint.
        fingerprint: String,
        /// Message id.
        id: String,
    },
    /// A message was deleted by its sender.
    Deleted {
        /// Contact fingerprint.
        fingerprint: String,
        /// Message id.
        id: String,
    },
    /// A contact changed display name.
    NameUpdated {
        /// Contact fingerprint.
        fingerprint: String,
        /// The new name.
        name: String,
    },
    /// A file transfer completed into the blob store.
    FileReceived {
        /// Sender fingerprint.
        fingerprint: String,
        /// Transfer id.
        tid: String,
        /// File name.
        name: String,
        /// Size in bytes.
        size: u64,
    },
}

/// A decrypted group message as surfaced to observers.
#[derive(Debug, Clone)]
pub struct GroupMessageView {
    /// Message id.
    pub id: String,
    /// Sender fingerprint.
    pub from_fp: String,
    /// Sender display name.
    pub from_name: String,
    /// Unix seconds at the sender.
    pub ts: i64,
    /// Decrypted text.
    pub text: String,
}

/// Group chat events.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// A group was created locally or joined via invite.
    Joined {
        /// Snapshot of the group.
        info: GroupInfo,
    },
    /// The group info snapshot changed (members, name).
    InfoUpdated {
        /// The new snapshot.
        info: GroupInfo,
    },
    /// A group message was decrypted.
    MessageReceived {
        /// Group id.
        group_id: String,
        /// The decrypted view.
        message: GroupMessageView,
    },
    /// The delivery list of one of our messages grew.
    Acked {
        /// Group id.
        group_id: String,
        /// Message id.
        id: String,
        /// Fingerprints reached so far.
        delivered_to: Vec<String>,
    },
    /// A message was edited.
    Edited {
        /// Group id.
        group_id: String,
        /// Message id.
        id: String,
    },
    /// A message was deleted.
    Deleted {
        /// Group id.
        group_id: String,
        /// Message id.
        id: String,
    },
    /// The group key rotated.
    KeyRotated {
        /// Group id.
        group_id: String,
    },
    /// A member joined.
    MemberJoined {
        /// Group id.
        group_id: String,
        /// Member fingerprint.
        fp: String,
        /// Member name.
        name: String,
    },
    /// A member left or was removed.
    MemberLeft {
        /// Group id.
        group_id: String,
        /// Member fingerprint.
        fp: String,
        /// Member name.
        name: String,
    },
    /// We were kicked from the group.
    Kicked {
        /// Group id.
        group_id: String,
    },
    /// A group file transfer completed.
    FileReceived {
        /// Group id.
        group_id: String,
        /// Sender fingerprint.
        from_fp: String,
        /// Transfer id.
        tid: String,
        /// File name.
        name: String,
        /// Size in bytes.
        size: u64,
    },
}

/// Group call signaling events.
#[derive(Debug, Clone)]
pub enum GroupCallEvent {
    /// A call started.
    Started {
        /// Group id.
        group_id: String,
        /// Call id.
        call_id: String,
        /// Call kind.
        kind: CallKind,
        /// Starter fingerprint.
        fp: String,
    },
    /// A participant joined.
    ParticipantJoined {
        /// Group id.
        group_id: String,
        /// Call id.
        call_id: String,
        /// Participant fingerprint.
        fp: String,
        /// Participant name.
        name: String,
        /// Participant transport address for the media mesh.
        address: String,
    },
    /// A participant left.
    ParticipantLeft {
        /// Group id.
        group_id: String,
        /// Call id.
        call_id: String,
        /// Participant fingerprint.
        fp: String,
    },
    /// The call ended.
    Ended {
        /// Group id.
        group_id: String,
        /// Call id.
        call_id: String,
    },
    /// A media-layer signal addressed to us.
    Signal {
        /// Group id.
        group_id: String,
        /// Call id.
        call_id: String,
        /// Media-layer discriminator.
        signal_type: String,
        /// Sender fingerprint.
        from_fp: String,
        /// Opaque payload.
        payload: serde_json::Value,
    },
}

/// Geographic discovery events.
#[derive(Debug, Clone)]
pub enum GeoEvent {
    /// The covering set changed.
    Enrolled {
        /// Enrolled cells, center first.
        cells: Vec<String>,
    },
    /// A peer appeared in one of our cells.
    PeerNearby {
        /// The cell.
        cell: String,
        /// The peer.
        peer: PeerInfo,
    },
}

/// Custom (named room) namespace events.
#[derive(Debug, Clone)]
pub enum CustomNsEvent {
    /// Role change in a room.
    Status {
        /// Room slug.
        slug: String,
        /// New role.
        role: Role,
        /// New level.
        level: u32,
    },
    /// A peer appeared in a room registry.
    PeerSeen {
        /// Room slug.
        slug: String,
        /// The peer.
        peer: PeerInfo,
    },
}

/// One broadcast sender per event family.
#[derive(Clone)]
pub struct EventBus {
    status: broadcast::Sender<StatusEvent>,
    message: broadcast::Sender<MessageEvent>,
    group: broadcast::Sender<GroupEvent>,
    group_call: broadcast::Sender<GroupCallEvent>,
    geo: broadcast::Sender<GeoEvent>,
    custom_ns: broadcast::Sender<CustomNsEvent>,
}

impl EventBus {
    /// New bus with the given per-family capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            status: broadcast::channel(capacity).0,
            message: broadcast::channel(capacity).0,
            group: broadcast::channel(capacity).0,
            group_call: broadcast::channel(capacity).0,
            geo: broadcast::channel(capacity).0,
            custom_ns: broadcast::channel(capacity).0,
        }
    }

    /// Subscribe to connectivity events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Subscribe to chat events.
    pub fn subscribe_message(&self) -> broadcast::Receiver<MessageEvent> {
        self.message.subscribe()
    }

    /// Subscribe to group events.
    pub fn subscribe_group(&self) -> broadcast::Receiver<GroupEvent> {
        self.group.subscribe()
    }

    /// Subscribe to group call events.
    pub fn subscribe_group_call(&self) -> broadcast::Receiver<GroupCallEvent> {
        self.group_call.subscribe()
    }

    /// Subscribe to geo events.
    pub fn subscribe_geo(&self) -> broadcast::Receiver<GeoEvent> {
        self.geo.subscribe()
    }

    /// Subscribe to custom namespace events.
    pub fn subscribe_custom_ns(&self) -> broadcast::Receiver<CustomNsEvent> {
        self.custom_ns.subscribe()
    }

    /// Emit a connectivity event.
    pub fn status(&self, event: StatusEvent) {
        let _ = self.status.send(event);
    }

    /// Emit a chat event.
    pub fn message(&self, event: MessageEvent) {
        let _ = self.message.send(event);
    }

    /// Emit a group event.
    pub fn group(&self, event: GroupEvent) {
        let _ = self.group.send(event);
    }

    /// Emit a group call event.
    pub fn group_call(&self, event: GroupCallEvent) {
        let _ = self.group_call.send(event);
    }

    /// Emit a geo event.
    pub fn geo(&self, event: GeoEvent) {
        let _ = self.geo.send(event);
    }

    /// Emit a custom namespace event.
    pub fn custom_ns(&self, event: CustomNsEvent) {
        let _ = self.custom_ns.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_status();
        bus.status(StatusEvent::NetworkDown);
        match rx.recv().await.unwrap() {
            StatusEvent::NetworkDown => {}
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_subscriber_is_fine() {
        let bus = EventBus::new(8);
        bus.geo(GeoEvent::Enrolled { cells: vec![] });
    }
}
