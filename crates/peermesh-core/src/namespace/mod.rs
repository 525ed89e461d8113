//! Namespace discovery overlay.
//!
//! A namespace is a set of peers sharing a router identity derived from
//! some common property (same IP, same room name, same geohash cell, same
//! group, same rendezvous window). One generic engine drives every flavor;
//! the drivers only supply naming closures.
//!
//! Per (namespace, level) exactly one honest peer holds the router
//! endpoint at a time. Everyone else joins it, mirrors its registry
//! broadcasts, and takes over through a jittered re-election when it
//! disappears.

mod config;
mod drivers;
mod engine;
mod registry;

pub use config::{NsConfig, SelfInfo};
pub use drivers::{
    custom_config, geo_config, group_config, public_ip_config, rendezvous_config, slugify,
};
pub use engine::{spawn, NamespaceHandle, NsCommand, NsEvent, NsStatus, Role};
pub use registry::{Registry, RegistryEntry};
