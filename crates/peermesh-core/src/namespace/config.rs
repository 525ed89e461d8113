//! Namespace naming configuration.
//!
//! One engine drives every namespace flavor; the only thing that differs
//! is how endpoint ids are derived. A config is the label plus three
//! naming closures.

use crate::DEFAULT_MAX_LEVEL;
use std::fmt;
use std::sync::Arc;

/// Naming scheme and limits for one namespace.
#[derive(Clone)]
pub struct NsConfig {
    /// Human-readable namespace label (also the event key).
    pub label: String,
    /// Router endpoint id for a given level.
    pub router_id: Arc<dyn Fn(u32) -> String + Send + Sync>,
    /// Discovery endpoint id for a given peer uuid.
    pub discovery_id: Arc<dyn Fn(&str) -> String + Send + Sync>,
    /// The NAT reverse-connect waiting slot id.
    pub peer_slot_id: Arc<dyn Fn() -> String + Send + Sync>,
    /// Highest level the engine escalates to before going offline.
    pub max_level: u32,
}

impl NsConfig {
    /// Standard naming over an app prefix and a namespace slug:
    /// router `{prefix}-{slug}-{level}`, discovery `{prefix}-{slug}-{uuid}`,
    /// peer slot `{prefix}-{slug}-p1`.
    pub fn standard(label: impl Into<String>, prefix: &str, slug: &str) -> Self {
        let base = format!("{prefix}-{slug}");
        let router_base = base.clone();
        let discovery_base = base.clone();
        let slot_base = base;
        Self {
            label: label.into(),
            router_id: Arc::new(move |level| format!("{router_base}-{level}")),
            discovery_id: Arc::new(move |uuid| format!("{discovery_base}-{uuid}")),
            peer_slot_id: Arc::new(move || format!("{slot_base}-p1")),
            max_level: DEFAULT_MAX_LEVEL,
        }
    }

    /// Override the escalation ceiling.
    pub fn with_max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }
}

impl fmt::Debug for NsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NsConfig")
            .field("label", &self.label)
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}

/// What this peer announces about itself inside a namespace.
#[derive(Debug, Clone)]
pub struct SelfInfo {
    /// Our per-peer discovery uuid (random 32-hex token).
    pub discovery_uuid: String,
    /// Our display name.
    pub friendly_name: String,
    /// Our base64 identity public key.
    pub public_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_naming() {
        let cfg = NsConfig::standard("room", "pmesh", "ns-lobby");
        assert_eq!((cfg.router_id)(1), "pmesh-ns-lobby-1");
        assert_eq!((cfg.router_id)(3), "pmesh-ns-lobby-3");
        assert_eq!((cfg.discovery_id)("abc123"), "pmesh-ns-lobby-abc123");
        assert_eq!((cfg.peer_slot_id)(), "pmesh-ns-lobby-p1");
        assert_eq!(cfg.max_level, DEFAULT_MAX_LEVEL);
    }

    #[test]
    fn test_max_level_override() {
        let cfg = NsConfig::standard("room", "pmesh", "ns-lobby").with_max_level(2);
        assert_eq!(cfg.max_level, 2);
    }
}
