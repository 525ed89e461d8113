//! Namespace flavor drivers.
//!
//! Each driver is a thin naming wrapper over the generic engine: it
//! produces the [`NsConfig`] for one flavor and nothing else.
//!
//! | flavor     | router id                      | purpose                  |
//! |------------|--------------------------------|--------------------------|
//! | public-ip  | `{prefix}-{ip-octets}-{level}` | same-network discovery   |
//! | custom     | `{prefix}-ns-{slug}-{level}`   | named rooms              |
//! | geo        | `{prefix}-geo-{cell}-{level}`  | physical proximity       |
//! | group      | `{prefix}-group-{gid}-{level}` | group chat routing       |
//! | rendezvous | `{prefix}-rvz-{slug}-{level}`  | per-pair reconnection    |

use crate::namespace::config::NsConfig;

/// Namespace over the peer's public IP: automatic same-network discovery.
pub fn public_ip_config(prefix: &str, public_ip: &str) -> NsConfig {
    let octets = slugify(public_ip);
    NsConfig::standard("public-ip", prefix, &octets)
}

/// Named room namespace.
pub fn custom_config(prefix: &str, slug: &str) -> NsConfig {
    NsConfig::standard(format!("custom:{slug}"), prefix, &format!("ns-{slug}"))
}

/// Physical-proximity namespace over one geohash cell.
///
/// The geo driver enrolls in a covering set of cells (see [`crate::geo`]);
/// each cell is its own independent namespace instance.
pub fn geo_config(prefix: &str, cell: &str) -> NsConfig {
    NsConfig::standard(format!("geo:{cell}"), prefix, &format!("geo-{cell}"))
}

/// Group chat routing namespace.
pub fn group_config(prefix: &str, group_id: &str) -> NsConfig {
    NsConfig::standard(
        format!("group:{group_id}"),
        prefix,
        &format!("group-{group_id}"),
    )
}

/// Per-pair rendezvous namespace under a time-rotating slug.
pub fn rendezvous_config(prefix: &str, slug: &str) -> NsConfig {
    NsConfig::standard(format!("rvz:{slug}"), prefix, &format!("rvz-{slug}"))
}

/// Reduce arbitrary user input (room names, IP strings) to a signaling-safe
/// slug: lowercase alphanumerics with single dashes.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("203.0.113.7"), "203-0-113-7");
        assert_eq!(slugify("My Cool Room!"), "my-cool-room");
        assert_eq!(slugify("--weird___input--"), "weird-input");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_public_ip_ids() {
        let cfg = public_ip_config("pmesh", "203.0.113.7");
        assert_eq!((cfg.router_id)(1), "pmesh-203-0-113-7-1");
        assert_eq!((cfg.peer_slot_id)(), "pmesh-203-0-113-7-p1");
        assert_eq!(cfg.label, "public-ip");
    }

    #[test]
    fn test_custom_ids() {
        let cfg = custom_config("pmesh", "lobby");
        assert_eq!((cfg.router_id)(2), "pmesh-ns-lobby-2");
        assert_eq!((cfg.discovery_id)("deadbeef"), "pmesh-ns-lobby-deadbeef");
        assert_eq!(cfg.label, "custom:lobby");
    }

    #[test]
    fn test_geo_group_rvz_ids() {
        assert_eq!(
            (geo_config("pmesh", "9q8yyk8").router_id)(1),
            "pmesh-geo-9q8yyk8-1"
        );
        assert_eq!(
            (group_config("pmesh", "1f2e3d4c5b6a7988").router_id)(1),
            "pmesh-group-1f2e3d4c5b6a7988-1"
        );
        assert_eq!(
            (rendezvous_config("pmesh", "AbC-dEf_19").router_id)(3),
            "pmesh-rvz-AbC-dEf_19-3"
        );
    }
}
