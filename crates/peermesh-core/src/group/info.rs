//! Group metadata and membership.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// The creator; may kick and invite.
    Admin,
    /// Regular member.
    Member,
}

/// One group member, keyed by fingerprint in [`GroupInfo::members`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    /// Display name.
    pub name: String,
    /// Role.
    pub role: MemberRole,
    /// Base64 identity public key.
    pub public_key: String,
    /// Last known transport address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_address: Option<String>,
    /// Unix seconds the member joined.
    pub joined_at: i64,
}

/// Group metadata snapshot.
///
/// The base64 group key is persisted locally and stripped from every copy
/// that travels on the wire ([`GroupInfo::wire_view`]); invitees receive
/// the key separately, encrypted under a pairwise key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    /// 16-hex-character group id.
    pub group_id: String,
    /// Display name.
    pub name: String,
    /// Creator fingerprint; the only member who may kick.
    pub admin: String,
    /// Members keyed by fingerprint.
    pub members: HashMap<String, GroupMember>,
    /// Share slug for invite links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_slug: Option<String>,
    /// Base64 of the current group key. Local persistence only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_key_b64: String,
    /// Base64 of superseded keys, newest first. Local persistence only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_history_b64: Vec<String>,
}

impl GroupInfo {
    /// New group with the creator as sole admin member.
    pub fn new(
        group_id: impl Into<String>,
        name: impl Into<String>,
        admin_fp: impl Into<String>,
        admin_member: GroupMember,
    ) -> Self {
        let admin_fp = admin_fp.into();
        let mut members = HashMap::new();
        members.insert(admin_fp.clone(), admin_member);
        Self {
            group_id: group_id.into(),
            name: name.into(),
            admin: admin_fp,
            members,
            invite_slug: None,
            group_key_b64: String::new(),
            key_history_b64: Vec::new(),
        }
    }

    /// Generate a fresh 16-hex group id from a UUID.
    pub fn generate_id() -> String {
        let uuid = uuid::Uuid::new_v4();
        uuid.simple().to_string()[..16].to_string()
    }

    /// Whether a fingerprint is the group admin.
    pub fn is_admin(&self, fingerprint: &str) -> bool {
        self.admin == fingerprint
    }

    /// Whether a fingerprint is a member.
    pub fn is_member(&self, fingerprint: &str) -> bool {
        self.members.contains_key(fingerprint)
    }

    /// Add or replace a member.
    pub fn upsert_member(&mut self, fingerprint: impl Into<String>, member: GroupMember) {
        self.members.insert(fingerprint.into(), member);
    }

    /// Remove a member, returning the record if present.
    pub fn remove_member(&mut self, fingerprint: &str) -> Option<GroupMember> {
        self.members.remove(fingerprint)
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Copy of the snapshot with all key material stripped, safe to put
    /// on the wire.
    pub fn wire_view(&self) -> GroupInfo {
        let mut view = self.clone();
        view.group_key_b64 = String::new();
        view.key_history_b64 = Vec::new();
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> GroupMember {
        GroupMember {
            name: name.into(),
            role: MemberRole::Member,
            public_key: "pk".into(),
            current_address: None,
            joined_at: 0,
        }
    }

    #[test]
    fn test_generate_id_shape() {
        let id = GroupInfo::generate_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, GroupInfo::generate_id());
    }

    #[test]
    fn test_admin_membership() {
        let mut admin = member("ada");
        admin.role = MemberRole::Admin;
        let info = GroupInfo::new("0011223344556677", "team", "fp-ada", admin);

        assert!(info.is_admin("fp-ada"));
        assert!(!info.is_admin("fp-bob"));
        assert!(info.is_member("fp-ada"));
        assert_eq!(info.member_count(), 1);
    }

    #[test]
    fn test_wire_view_strips_keys() {
        let mut admin = member("ada");
        admin.role = MemberRole::Admin;
        let mut info = GroupInfo::new("0011223344556677", "team", "fp-ada", admin);
        info.group_key_b64 = "c2VjcmV0".into();
        info.key_history_b64 = vec!["b2xk".into()];

        let view = info.wire_view();
        assert!(view.group_key_b64.is_empty());
        assert!(view.key_history_b64.is_empty());
        assert_eq!(view.member_count(), 1);

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("c2VjcmV0"));
        assert!(!json.contains("key_history"));
    }
}
