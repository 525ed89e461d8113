//! Multi-peer namespace scenarios over the in-memory transport.
//!
//! Each simulated peer gets its own signaling gate (the gate is
//! process-wide per real peer, and every test peer stands in for one
//! process).

use peermesh_core::namespace::{self, public_ip_config, NamespaceHandle, NsEvent, Role, SelfInfo};
use peermesh_core::protocol::PeerInfo;
use peermesh_core::signaling::SignalingGate;
use peermesh_core::transport::{MemoryHub, Reachability};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct TestPeer {
    name: &'static str,
    handle: NamespaceHandle,
    events: mpsc::UnboundedReceiver<NsEvent>,
    latest_registry: Vec<PeerInfo>,
}

impl TestPeer {
    fn spawn(hub: &Arc<MemoryHub>, name: &'static str) -> Self {
        let gate = SignalingGate::spawn(Arc::clone(hub) as Arc<dyn Reachability>);
        let (tx, events) = mpsc::unbounded_channel();
        let handle = namespace::spawn(
            public_ip_config("pmesh", "203.0.113.9"),
            SelfInfo {
                discovery_uuid: peermesh_core::crypto::random_token(),
                friendly_name: name.to_string(),
                public_key: Some(format!("pk-{name}")),
            },
            Arc::new(hub.transport()),
            gate,
            tx,
        );
        Self {
            name,
            handle,
            events,
            latest_registry: Vec::new(),
        }
    }

    /// Pull everything queued, keeping the newest registry view.
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let NsEvent::Registry { peers, .. } = event {
                self.latest_registry = peers;
            }
        }
    }

    fn role(&self) -> Role {
        self.handle.status().role
    }

    fn level(&self) -> u32 {
        self.handle.status().level
    }
}

fn count_roles(peers: &[&TestPeer]) -> (usize, usize) {
    let routers = peers.iter().filter(|p| p.role() == Role::Router).count();
    let members = peers.iter().filter(|p| p.role() == Role::Member).count();
    (routers, members)
}

#[tokio::test(start_paused = true)]
async fn test_election_produces_one_router() {
    let hub = MemoryHub::new();
    let mut peers = vec![
        TestPeer::spawn(&hub, "a"),
        TestPeer::spawn(&hub, "b"),
        TestPeer::spawn(&hub, "c"),
    ];

    tokio::time::sleep(Duration::from_secs(20)).await;
    for peer in &mut peers {
        peer.drain();
    }

    let refs: Vec<&TestPeer> = peers.iter().collect();
    let (routers, members) = count_roles(&refs);
    assert_eq!(routers, 1, "exactly one router");
    assert_eq!(members, 2, "the rest are members");
    assert!(peers.iter().all(|p| p.level() == 1), "everyone at level 1");

    for peer in &peers {
        assert_eq!(
            peer.latest_registry.len(),
            3,
            "{} sees all three peers, saw {:?}",
            peer.name,
            peer.latest_registry
        );
    }

    for peer in &peers {
        peer.handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_failover_elects_new_router() {
    let hub = MemoryHub::new();
    let mut peers = vec![
        TestPeer::spawn(&hub, "a"),
        TestPeer::spawn(&hub, "b"),
        TestPeer::spawn(&hub, "c"),
    ];

    tokio::time::sleep(Duration::from_secs(20)).await;
    for peer in &mut peers {
        peer.drain();
    }

    let router_idx = peers
        .iter()
        .position(|p| p.role() == Role::Router)
        .expect("a router was elected");
    let dead = peers.remove(router_idx);
    dead.handle.shutdown();

    // Jittered failover: within a few seconds one survivor wins the claim
    // and the other joins it.
    tokio::time::sleep(Duration::from_secs(15)).await;
    for peer in &mut peers {
        peer.drain();
    }

    let refs: Vec<&TestPeer> = peers.iter().collect();
    let (routers, members) = count_roles(&refs);
    assert_eq!(routers, 1, "exactly one new router");
    assert_eq!(members, 1, "the survivor rejoined");

    for peer in &peers {
        assert_eq!(
            peer.latest_registry.len(),
            2,
            "{} sees the two survivors, saw {:?}",
            peer.name,
            peer.latest_registry
        );
    }

    for peer in &peers {
        peer.handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_member_leave_shrinks_registry() {
    let hub = MemoryHub::new();
    let mut peers = vec![
        TestPeer::spawn(&hub, "a"),
        TestPeer::spawn(&hub, "b"),
        TestPeer::spawn(&hub, "c"),
    ];

    tokio::time::sleep(Duration::from_secs(20)).await;
    for peer in &mut peers {
        peer.drain();
    }

    let member_idx = peers
        .iter()
        .position(|p| p.role() == Role::Member)
        .expect("members exist");
    let leaver = peers.remove(member_idx);
    leaver.handle.shutdown();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let router = peers
        .iter_mut()
        .find(|p| p.role() == Role::Router)
        .expect("router survived");
    router.drain();
    assert_eq!(
        router.latest_registry.len(),
        2,
        "router dropped the leaver: {:?}",
        router.latest_registry
    );

    for peer in &peers {
        peer.handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_same_key_evicts_stale_entry() {
    let hub = MemoryHub::new();
    let mut peers = vec![TestPeer::spawn(&hub, "a"), TestPeer::spawn(&hub, "b")];
    tokio::time::sleep(Duration::from_secs(15)).await;
    for peer in &mut peers {
        peer.drain();
    }
    assert_eq!(peers[0].latest_registry.len(), 2);

    // The member vanishes and comes back under a fresh discovery uuid but
    // the same public key.
    let member_idx = peers
        .iter()
        .position(|p| p.role() == Role::Member)
        .expect("member exists");
    let member_name = peers[member_idx].name;
    let old = peers.remove(member_idx);
    old.handle.shutdown();
    tokio::time::sleep(Duration::from_secs(2)).await;

    peers.push(TestPeer::spawn(&hub, member_name));
    tokio::time::sleep(Duration::from_secs(15)).await;

    let router = peers
        .iter_mut()
        .find(|p| p.role() == Role::Router)
        .expect("router still up");
    router.drain();
    let key = format!("pk-{member_name}");
    let same_key: Vec<&PeerInfo> = router
        .latest_registry
        .iter()
        .filter(|p| p.public_key.as_deref() == Some(key.as_str()))
        .collect();
    assert_eq!(
        same_key.len(),
        1,
        "duplicate public key deduplicated: {:?}",
        router.latest_registry
    );

    for peer in &peers {
        peer.handle.shutdown();
    }
}
