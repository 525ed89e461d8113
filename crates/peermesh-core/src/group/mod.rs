//! Encrypted group chats.
//!
//! A group is a namespace (flavor `group`) plus shared state: metadata,
//! an AES-256-GCM group key with rotation history, a message log kept in
//! ciphertext for backfill, file assemblies, and call-participant state.
//! Whoever currently holds the namespace router id relays messages
//! star-style; membership is independent of who that happens to be.

mod call;
mod engine;
mod files;
mod info;
mod keys;

pub use call::{CallParticipant, GroupCallState};
pub use engine::{CompletedFile, GroupState};
pub use files::{chunk_bytes, FileAssembly};
pub use info::{GroupInfo, GroupMember, MemberRole};
pub use keys::{generate_group_key, GroupKeyring};
