//! Group call participant state.
//!
//! Signaling-only: the core tracks who is in the call and relays media
//! negotiation signals through the router; media streams themselves flow
//! mesh-style between participants, outside the core. A participant that
//! appears here without a media stream yet is "connecting".

use crate::protocol::CallKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One call participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParticipant {
    /// Display name.
    pub name: String,
    /// Transport address for the media mesh.
    pub address: String,
    /// Unix seconds the participant joined.
    pub joined_at: i64,
}

/// State of the (at most one) active call in a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCallState {
    /// Call id.
    pub call_id: String,
    /// Call kind.
    pub kind: CallKind,
    /// Participants keyed by fingerprint.
    pub participants: HashMap<String, CallParticipant>,
}

impl GroupCallState {
    /// New call with its starter as first participant.
    pub fn new(
        call_id: impl Into<String>,
        kind: CallKind,
        starter_fp: impl Into<String>,
        starter: CallParticipant,
    ) -> Self {
        let mut participants = HashMap::new();
        participants.insert(starter_fp.into(), starter);
        Self {
            call_id: call_id.into(),
            kind,
            participants,
        }
    }

    /// Add a participant. Re-joining refreshes the record.
    pub fn join(&mut self, fingerprint: impl Into<String>, participant: CallParticipant) {
        self.participants.insert(fingerprint.into(), participant);
    }

    /// Remove a participant. Returns true if they were in the call.
    pub fn leave(&mut self, fingerprint: &str) -> bool {
        self.participants.remove(fingerprint).is_some()
    }

    /// Whether anyone is still in the call.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Number of participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str) -> CallParticipant {
        CallParticipant {
            name: name.into(),
            address: format!("addr-{name}"),
            joined_at: 0,
        }
    }

    #[test]
    fn test_join_leave_lifecycle() {
        let mut call = GroupCallState::new("c1", CallKind::Audio, "fp-a", participant("a"));
        assert_eq!(call.participant_count(), 1);

        call.join("fp-b", participant("b"));
        assert_eq!(call.participant_count(), 2);

        assert!(call.leave("fp-a"));
        assert!(!call.leave("fp-a"));
        assert!(call.leave("fp-b"));
        assert!(call.is_empty());
    }

    #[test]
    fn test_rejoin_refreshes() {
        let mut call = GroupCallState::new("c1", CallKind::Video, "fp-a", participant("a"));
        let mut again = participant("a");
        again.address = "addr-new".into();
        call.join("fp-a", again);
        assert_eq!(call.participant_count(), 1);
        assert_eq!(call.participants["fp-a"].address, "addr-new");
    }
}
