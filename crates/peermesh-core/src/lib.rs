//! # Peermesh Core Library
//!
//! A serverless, end-to-end encrypted peer messaging overlay. Peers connect
//! directly over a WebRTC-like transport and use only a lightweight
//! signaling rendezvous; no server ever holds message state.
//!
//! On top of the bare transport the core provides:
//!
//! - a self-healing discovery overlay (same network, same named room, same
//!   physical area, same group) with per-namespace router election and
//!   failover
//! - a cryptographic identity that survives address changes
//! - a time-rotating pairwise rendezvous that reconnects two contacts even
//!   after both have lost each other's transport address
//! - encrypted group chats with key rotation and a floating coordinator
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 application                 │
//! ├─────────────────────────────────────────────┤
//! │  manager  │  router  │ rendezvous │  group  │
//! ├─────────────────────────────────────────────┤
//! │        namespace engine + drivers           │
//! ├─────────────────────────────────────────────┤
//! │   signaling gate   │   transport (trait)    │
//! ├─────────────────────────────────────────────┤
//! │       crypto       │       storage          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! All shared state is owned by single tasks; components communicate over
//! typed channels. The signaling gate is the only process-wide resource and
//! is passed to every component as an explicit handle.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod contact;
pub mod crypto;
pub mod error;
pub mod events;
pub mod geo;
pub mod group;
pub mod logging;
pub mod manager;
pub mod namespace;
pub mod protocol;
pub mod rendezvous;
pub mod router;
pub mod signaling;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default namespace label prefix for all signaling endpoint ids.
pub const DEFAULT_PREFIX: &str = "pmesh";

/// Seconds a registry entry may go without a check-in before eviction.
pub const REGISTRY_TTL_SECS: i64 = 90;

/// Grace added on top of [`REGISTRY_TTL_SECS`] before the router evicts.
pub const REGISTRY_TTL_GRACE_SECS: i64 = 10;

/// Interval between router pings to registered peers.
pub const PING_INTERVAL_SECS: u64 = 60;

/// Interval at which high-level namespaces probe for a free level 1.
pub const LEVEL_MONITOR_INTERVAL_SECS: u64 = 30;

/// Interval at which the router probes the peer-slot id for NAT'd waiters.
pub const PEER_SLOT_PROBE_INTERVAL_SECS: u64 = 30;

/// Wall-clock width of one rendezvous window.
pub const RENDEZVOUS_WINDOW_SECS: i64 = 600;

/// Interval of the rendezvous activation sweep.
pub const RENDEZVOUS_SWEEP_SECS: u64 = 60;

/// Interval of the offline-contact reconnection sweep.
pub const CONTACT_SWEEP_SECS: u64 = 30;

/// Keep-alive heartbeat on direct peer channels.
pub const KEEPALIVE_SECS: u64 = 45;

/// Heartbeat keeping our persistent discovery endpoint registered.
pub const ENDPOINT_HEARTBEAT_SECS: u64 = 20;

/// Periodic re-checkin interval for namespace members.
pub const CHECKIN_INTERVAL_SECS: u64 = 300;

/// Highest router level the engine escalates to by default.
pub const DEFAULT_MAX_LEVEL: u32 = 5;

/// Maximum size of a single group file chunk (16 KiB).
pub const MAX_FILE_CHUNK_SIZE: usize = 16 * 1024;

/// Unacknowledged messages older than this reset to `Waiting` (2 min).
pub const ACK_TIMEOUT_SECS: i64 = 120;

/// Direct connection attempts before a contact is handed to rendezvous.
pub const MAX_CONNECT_RETRIES: u32 = 3;
