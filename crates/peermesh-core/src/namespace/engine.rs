//! The generic namespace state machine.
//!
//! One engine instance drives one namespace. Its task owns all namespace
//! state; per-connection reader tasks only forward frames into the engine,
//! so no two tasks ever mutate the same registry.
//!
//! ```text
//! idle → electing(L) ─ claim ok ──────────→ router(L)
//!            │
//!            └ id taken → joining(L) ─ ok → member(L)
//!                             │
//!                             └ 3 failures → peer-slot(L) ─ welcome → member(L)
//!                                                │
//!                                                └ 5 misses → electing(L+1)
//! ```
//!
//! Network-level failures never escalate; the engine pauses until the
//! signaling gate reports recovery. Exhausting `max_level` parks the
//! namespace in a visible offline state until retried or shut down.

use crate::error::{Error, Result};
use crate::namespace::config::{NsConfig, SelfInfo};
use crate::namespace::registry::Registry;
use crate::protocol::{PeerInfo, WireMessage};
use crate::signaling::{Priority, SignalingGate};
use crate::transport::{Channel, ChannelSender, Endpoint, Transport};
use crate::{LEVEL_MONITOR_INTERVAL_SECS, PEER_SLOT_PROBE_INTERVAL_SECS, PING_INTERVAL_SECS};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

/// How long a join attempt may hang before it counts as failed.
const JOIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Join attempts before falling back to the peer slot.
const JOIN_RETRIES: u32 = 3;

/// Peer-slot waits before escalating one level.
const SLOT_RETRIES: u32 = 5;

/// Role of this peer within one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not yet participating.
    Idle,
    /// Racing for the router id.
    Electing,
    /// Router id was taken; connecting to its holder.
    Joining,
    /// Waiting on the reverse-connect slot.
    PeerSlot,
    /// Checked in at the router.
    Member,
    /// Holding the router id and the registry.
    Router,
    /// All levels exhausted; parked until retried.
    Offline,
}

/// Externally visible state of one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsStatus {
    /// Current role.
    pub role: Role,
    /// Current level.
    pub level: u32,
}

/// Events the engine emits to its owner.
#[derive(Debug)]
pub enum NsEvent {
    /// Role or level changed.
    Status {
        /// Namespace label.
        label: String,
        /// New role.
        role: Role,
        /// New level.
        level: u32,
    },
    /// The registry view changed (broadcast received, or, as router,
    /// recomputed).
    Registry {
        /// Namespace label.
        label: String,
        /// Full replacement view.
        peers: Vec<PeerInfo>,
    },
    /// Non-namespace traffic arrived from the router (member side).
    FromRouter {
        /// Namespace label.
        label: String,
        /// The decoded message.
        msg: WireMessage,
    },
    /// Non-namespace traffic arrived from a member (router side).
    FromMember {
        /// Namespace label.
        label: String,
        /// The member's discovery address.
        from: String,
        /// The decoded message.
        msg: WireMessage,
        /// Reply handle onto the member connection.
        reply: ChannelSender,
    },
    /// Traffic arrived on our namespace discovery endpoint.
    Direct {
        /// Namespace label.
        label: String,
        /// The decoded message.
        msg: WireMessage,
        /// Reply handle onto the inbound channel.
        reply: ChannelSender,
    },
    /// Every level is exhausted; the namespace is parked.
    Offline {
        /// Namespace label.
        label: String,
    },
}

/// Commands accepted by a running engine.
#[derive(Debug)]
pub enum NsCommand {
    /// Send a message to the router (member role).
    SendToRouter(WireMessage),
    /// Send a message to one registered member (router role).
    SendToPeer {
        /// The member's discovery address.
        address: String,
        /// The message.
        msg: WireMessage,
    },
    /// Send a message to every registered member (router role).
    Broadcast(WireMessage),
    /// Leave the parked offline state and re-attempt from level 1.
    Retry,
    /// Tear the namespace down.
    Shutdown,
}

/// Handle onto a spawned namespace engine.
#[derive(Debug, Clone)]
pub struct NamespaceHandle {
    label: String,
    cmd_tx: mpsc::UnboundedSender<NsCommand>,
    status_rx: watch::Receiver<NsStatus>,
    active: Arc<AtomicBool>,
}

impl NamespaceHandle {
    /// The namespace label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current role and level.
    pub fn status(&self) -> NsStatus {
        self.status_rx.borrow().clone()
    }

    /// Whether the namespace has not been shut down.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Send a message to the router.
    pub fn send_to_router(&self, msg: WireMessage) -> Result<()> {
        self.command(NsCommand::SendToRouter(msg))
    }

    /// As router, send a message to one member.
    pub fn send_to_peer(&self, address: impl Into<String>, msg: WireMessage) -> Result<()> {
        self.command(NsCommand::SendToPeer {
            address: address.into(),
            msg,
        })
    }

    /// As router, send a message to every member.
    pub fn broadcast(&self, msg: WireMessage) -> Result<()> {
        self.command(NsCommand::Broadcast(msg))
    }

    /// Re-attempt a parked namespace from level 1.
    pub fn retry(&self) {
        let _ = self.cmd_tx.send(NsCommand::Retry);
    }

    /// Tear the namespace down, cancelling queued elections and timers.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(NsCommand::Shutdown);
    }

    fn command(&self, cmd: NsCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::State("namespace task gone".into()))
    }
}

/// Start an engine for the given namespace.
pub fn spawn(
    config: NsConfig,
    me: SelfInfo,
    transport: Arc<dyn Transport>,
    gate: SignalingGate,
    events: mpsc::UnboundedSender<NsEvent>,
) -> NamespaceHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(NsStatus {
        role: Role::Idle,
        level: 0,
    });
    let active = Arc::new(AtomicBool::new(true));
    let handle = NamespaceHandle {
        label: config.label.clone(),
        cmd_tx,
        status_rx,
        active: Arc::clone(&active),
    };

    let shared = Shared {
        config,
        me,
        transport,
        gate,
        events,
        status_tx,
        active,
    };
    tokio::spawn(run(shared, cmd_rx));
    handle
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

struct Shared {
    config: NsConfig,
    me: SelfInfo,
    transport: Arc<dyn Transport>,
    gate: SignalingGate,
    events: mpsc::UnboundedSender<NsEvent>,
    status_tx: watch::Sender<NsStatus>,
    active: Arc<AtomicBool>,
}

impl Shared {
    fn set_status(&self, role: Role, level: u32) {
        let _ = self.status_tx.send_replace(NsStatus { role, level });
        let _ = self.events.send(NsEvent::Status {
            label: self.config.label.clone(),
            role,
            level,
        });
    }

    fn emit(&self, event: NsEvent) {
        let _ = self.events.send(event);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn discovery_address(&self) -> String {
        (self.config.discovery_id)(&self.me.discovery_uuid)
    }

    fn self_info(&self, now: i64) -> PeerInfo {
        PeerInfo {
            address: self.discovery_address(),
            name: self.me.friendly_name.clone(),
            public_key: self.me.public_key.clone(),
            last_seen: now,
        }
    }

    fn checkin_message(&self) -> WireMessage {
        WireMessage::Checkin {
            discovery_id: self.discovery_address(),
            friendly_name: self.me.friendly_name.clone(),
            public_key: self.me.public_key.clone(),
        }
    }
}

enum Inbound {
    Frame { conn: u64, bytes: Vec<u8> },
    Closed { conn: u64 },
}

fn spawn_reader(
    conn: u64,
    mut rx: crate::transport::ChannelReceiver,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if tx.send(Inbound::Frame { conn, bytes }).is_err() {
                return;
            }
        }
        let _ = tx.send(Inbound::Closed { conn });
    });
}

async fn accept_opt(endpoint: &mut Option<Endpoint>) -> Option<Channel> {
    match endpoint {
        Some(ep) => ep.accept().await,
        None => std::future::pending().await,
    }
}

enum Attempt {
    Router(Endpoint),
    Member(Channel),
    Escalate,
    NetworkPause,
    Shutdown,
}

enum ClaimResult {
    Claimed(Endpoint),
    Taken,
    Failed,
    Network,
    Shutdown,
}

enum Exit {
    /// Re-attempt at the given level (same level = failover).
    Restart(u32),
    Shutdown,
}

struct Conns {
    /// Engine-wide id source; stale readers from a previous role phase
    /// must never collide with fresh connections.
    counter: Arc<AtomicU64>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    senders: HashMap<u64, ChannelSender>,
    addresses: HashMap<u64, String>,
}

impl Conns {
    fn new(inbound_tx: mpsc::UnboundedSender<Inbound>, counter: Arc<AtomicU64>) -> Self {
        Self {
            counter,
            inbound_tx,
            senders: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    fn add(&mut self, channel: Channel) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = channel.split();
        self.senders.insert(id, sender);
        spawn_reader(id, receiver, self.inbound_tx.clone());
        id
    }

    fn sender(&self, conn: u64) -> Option<&ChannelSender> {
        self.senders.get(&conn)
    }

    fn bind_address(&mut self, conn: u64, address: String) {
        self.addresses.insert(conn, address);
    }

    fn address(&self, conn: u64) -> Option<&str> {
        self.addresses.get(&conn).map(String::as_str)
    }

    fn conn_for_address(&self, address: &str) -> Option<u64> {
        self.addresses
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(c, _)| *c)
    }

    fn remove(&mut self, conn: u64) {
        self.senders.remove(&conn);
        self.addresses.remove(&conn);
    }
}

async fn run(shared: Shared, mut cmd_rx: mpsc::UnboundedReceiver<NsCommand>) {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let conn_counter = Arc::new(AtomicU64::new(0));
    let label = shared.config.label.clone();

    // Our per-namespace discovery endpoint: the address other peers in this
    // namespace use to reach us directly. Claimed once, kept for the whole
    // namespace lifetime.
    let mut discovery = match claim_discovery(&shared, &mut cmd_rx).await {
        DiscoveryOutcome::Claimed(ep) => Some(ep),
        DiscoveryOutcome::Unavailable => {
            warn!(ns = %label, "discovery endpoint unavailable, continuing without");
            None
        }
        DiscoveryOutcome::Shutdown => return,
    };

    let mut level = 1u32;
    loop {
        if !shared.is_active() {
            break;
        }
        shared.set_status(Role::Electing, level);
        match attempt_level(&shared, &mut cmd_rx, level).await {
            Attempt::Router(endpoint) => {
                match run_router(
                    &shared,
                    &mut cmd_rx,
                    &mut inbound_rx,
                    &inbound_tx,
                    &conn_counter,
                    &mut discovery,
                    endpoint,
                    level,
                )
                .await
                {
                    Exit::Shutdown => break,
                    Exit::Restart(next) => level = next,
                }
            }
            Attempt::Member(channel) => {
                match run_member(
                    &shared,
                    &mut cmd_rx,
                    &mut inbound_rx,
                    &inbound_tx,
                    &conn_counter,
                    &mut discovery,
                    channel,
                    level,
                )
                .await
                {
                    Exit::Shutdown => break,
                    Exit::Restart(next) => {
                        if next == level {
                            // Concurrent failover tie-break: the earliest
                            // wake-up wins the claim.
                            let jitter = rand::thread_rng().gen_range(0..3000);
                            tokio::time::sleep(Duration::from_millis(jitter)).await;
                        }
                        level = next;
                    }
                }
            }
            Attempt::Escalate => {
                if level >= shared.config.max_level {
                    shared.set_status(Role::Offline, level);
                    shared.emit(NsEvent::Offline {
                        label: label.clone(),
                    });
                    if park_offline(&mut cmd_rx).await {
                        level = 1;
                    } else {
                        break;
                    }
                } else {
                    level += 1;
                }
            }
            Attempt::NetworkPause => {
                if !wait_for_network(&shared, &mut cmd_rx).await {
                    break;
                }
            }
            Attempt::Shutdown => break,
        }
    }
    shared.set_status(Role::Idle, 0);
    debug!(ns = %label, "namespace engine stopped");
}

enum DiscoveryOutcome {
    Claimed(Endpoint),
    Unavailable,
    Shutdown,
}

async fn claim_discovery(
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<NsCommand>,
) -> DiscoveryOutcome {
    loop {
        if !shared.is_active() {
            return DiscoveryOutcome::Shutdown;
        }
        match claim_via_gate(shared, &shared.discovery_address(), Priority::Normal).await {
            ClaimResult::Claimed(ep) => return DiscoveryOutcome::Claimed(ep),
            ClaimResult::Taken | ClaimResult::Failed => return DiscoveryOutcome::Unavailable,
            ClaimResult::Network => {
                if !wait_for_network(shared, cmd_rx).await {
                    return DiscoveryOutcome::Shutdown;
                }
            }
            ClaimResult::Shutdown => return DiscoveryOutcome::Shutdown,
        }
    }
}

async fn claim_via_gate(shared: &Shared, id: &str, priority: Priority) -> ClaimResult {
    let (tx, rx) = oneshot::channel();
    let transport = Arc::clone(&shared.transport);
    let id_owned = id.to_string();
    let still_active = Arc::clone(&shared.active);
    shared.gate.schedule(
        priority,
        move || still_active.load(Ordering::SeqCst),
        move || async move {
            let result = transport.create_endpoint(&id_owned).await;
            let _ = tx.send(result);
        },
    );
    match rx.await {
        Err(_) => ClaimResult::Shutdown,
        Ok(Ok(endpoint)) => {
            shared.gate.report_success();
            ClaimResult::Claimed(endpoint)
        }
        Ok(Err(Error::AddressTaken(_))) => ClaimResult::Taken,
        Ok(Err(e)) if e.is_network() => {
            shared.gate.report_failure().await;
            ClaimResult::Network
        }
        Ok(Err(_)) => ClaimResult::Failed,
    }
}

/// Wait until the gate is no longer network-down. Returns false on shutdown.
async fn wait_for_network(
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<NsCommand>,
) -> bool {
    let mut status_rx = shared.gate.subscribe();
    loop {
        if !shared.is_active() {
            return false;
        }
        if !status_rx.borrow().network_down {
            return true;
        }
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(NsCommand::Shutdown) | None => return false,
                _ => {}
            },
        }
    }
}

/// Park in the offline state until `Retry` (true) or `Shutdown` (false).
async fn park_offline(cmd_rx: &mut mpsc::UnboundedReceiver<NsCommand>) -> bool {
    loop {
        match cmd_rx.recv().await {
            Some(NsCommand::Retry) => return true,
            Some(NsCommand::Shutdown) | None => return false,
            _ => {}
        }
    }
}

async fn attempt_level(
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<NsCommand>,
    level: u32,
) -> Attempt {
    let router_addr = (shared.config.router_id)(level);

    // 1. Race for the router id.
    match claim_via_gate(shared, &router_addr, Priority::Normal).await {
        ClaimResult::Claimed(endpoint) => {
            info!(ns = %shared.config.label, level, "claimed router id");
            return Attempt::Router(endpoint);
        }
        ClaimResult::Taken => {}
        ClaimResult::Network => return Attempt::NetworkPause,
        ClaimResult::Shutdown => return Attempt::Shutdown,
        ClaimResult::Failed => return Attempt::Escalate,
    }

    // 2. Someone else holds it: join them.
    shared.set_status(Role::Joining, level);
    for attempt in 1..=JOIN_RETRIES {
        if !shared.is_active() {
            return Attempt::Shutdown;
        }
        match timeout(JOIN_TIMEOUT, shared.transport.connect(&router_addr)).await {
            Ok(Ok(channel)) => return Attempt::Member(channel),
            Ok(Err(e)) if e.is_network() => return Attempt::NetworkPause,
            Ok(Err(_)) | Err(_) => {
                debug!(ns = %shared.config.label, level, attempt, "join attempt failed");
            }
        }
    }

    // 3. The router may be unable to hear us but able to reach us: claim
    // the peer slot and wait for its reverse connect.
    shared.set_status(Role::PeerSlot, level);
    for _ in 0..SLOT_RETRIES {
        if !shared.is_active() {
            return Attempt::Shutdown;
        }
        match peer_slot_wait(shared).await {
            SlotResult::Member(channel) => return Attempt::Member(channel),
            SlotResult::Network => return Attempt::NetworkPause,
            SlotResult::Shutdown => return Attempt::Shutdown,
            SlotResult::Miss => {
                let jitter = rand::thread_rng().gen_range(3000..5000);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
                    cmd = cmd_rx.recv() => match cmd {
                        Some(NsCommand::Shutdown) | None => return Attempt::Shutdown,
                        _ => {}
                    },
                }
            }
        }
    }
    Attempt::Escalate
}

enum SlotResult {
    Member(Channel),
    Miss,
    Network,
    Shutdown,
}

async fn peer_slot_wait(shared: &Shared) -> SlotResult {
    let slot_id = (shared.config.peer_slot_id)();
    // Id-taken on the slot means another waiter holds it; expected miss,
    // not worth a failure report.
    let mut endpoint = match claim_via_gate(shared, &slot_id, Priority::Normal).await {
        ClaimResult::Claimed(ep) => ep,
        ClaimResult::Taken | ClaimResult::Failed => return SlotResult::Miss,
        ClaimResult::Network => return SlotResult::Network,
        ClaimResult::Shutdown => return SlotResult::Shutdown,
    };

    // The router probes the slot every 30 s; wait one full cycle plus slack.
    let wait = Duration::from_secs(PEER_SLOT_PROBE_INTERVAL_SECS + 5);
    let mut channel = match timeout(wait, endpoint.accept()).await {
        Ok(Some(ch)) => ch,
        Ok(None) | Err(_) => return SlotResult::Miss,
    };
    match timeout(JOIN_TIMEOUT, channel.recv()).await {
        Ok(Some(bytes)) => match WireMessage::decode(&bytes) {
            Ok(WireMessage::ReverseWelcome) => SlotResult::Member(channel),
            _ => SlotResult::Miss,
        },
        Ok(None) | Err(_) => SlotResult::Miss,
    }
}

// ---------------------------------------------------------------------------
// Router role
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_router(
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<NsCommand>,
    inbound_rx: &mut mpsc::UnboundedReceiver<Inbound>,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    conn_counter: &Arc<AtomicU64>,
    discovery: &mut Option<Endpoint>,
    mut endpoint: Endpoint,
    level: u32,
) -> Exit {
    shared.set_status(Role::Router, level);
    let label = shared.config.label.clone();
    let now = chrono::Utc::now().timestamp();

    let mut registry = Registry::new();
    registry.set_self(shared.self_info(now));

    let mut conns = Conns::new(inbound_tx.clone(), Arc::clone(conn_counter));
    // Direct channels accepted on the discovery endpoint, kept apart from
    // member connections.
    let mut direct: HashMap<u64, ChannelSender> = HashMap::new();

    broadcast_registry(shared, &registry);

    let mut ping_timer = interval(Duration::from_secs(PING_INTERVAL_SECS));
    let mut slot_timer = interval(Duration::from_secs(PEER_SLOT_PROBE_INTERVAL_SECS));
    let mut monitor_timer = interval(Duration::from_secs(LEVEL_MONITOR_INTERVAL_SECS));
    // First interval tick fires immediately; consume it so the timers
    // behave periodically from here on.
    ping_timer.tick().await;
    slot_timer.tick().await;
    monitor_timer.tick().await;

    loop {
        if !shared.is_active() {
            return Exit::Shutdown;
        }
        tokio::select! {
            accepted = endpoint.accept() => match accepted {
                Some(channel) => {
                    conns.add(channel);
                }
                // Registration lost under us: nothing to broadcast, start over.
                None => return Exit::Restart(level),
            },

            accepted = accept_opt(discovery) => if let Some(channel) = accepted {
                let id = conns.add(channel);
                if let Some(sender) = conns.sender(id) {
                    direct.insert(id, sender.clone());
                }
            },

            inbound = inbound_rx.recv() => match inbound {
                Some(Inbound::Frame { conn, bytes }) => {
                    if let Some(exit) = router_frame(
                        shared, &mut registry, &mut conns, &direct, conn, &bytes,
                    ) {
                        return exit;
                    }
                }
                Some(Inbound::Closed { conn }) => {
                    if direct.remove(&conn).is_none() {
                        if let Some(address) = conns.address(conn).map(String::from) {
                            registry.remove(&address);
                            broadcast_registry(shared, &registry);
                        }
                    }
                    conns.remove(conn);
                }
                None => return Exit::Shutdown,
            },

            _ = ping_timer.tick() => {
                let now = chrono::Utc::now().timestamp();
                let expired = registry.evict_expired(now);
                if !expired.is_empty() {
                    for address in &expired {
                        if let Some(conn) = conns.conn_for_address(address) {
                            conns.remove(conn);
                        }
                    }
                    debug!(ns = %label, evicted = expired.len(), "registry TTL eviction");
                }
                send_to_members(&registry, &WireMessage::Ping);
                if !expired.is_empty() {
                    broadcast_registry(shared, &registry);
                }
            }

            _ = slot_timer.tick() => {
                probe_peer_slot(shared, &mut conns).await;
            }

            _ = monitor_timer.tick(), if level > 1 => {
                if let Ok(channel) = shared.transport.connect(&(shared.config.router_id)(1)).await {
                    drop(channel);
                    info!(ns = %label, "level 1 reachable again, migrating down");
                    send_to_members(&registry, &WireMessage::Migrate { level: 1 });
                    return Exit::Restart(1);
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(NsCommand::SendToPeer { address, msg }) => {
                    if let Some(entry) = registry.get(&address) {
                        if let Some(conn) = &entry.conn {
                            send_frame(conn, &msg);
                        }
                    }
                }
                Some(NsCommand::Broadcast(msg)) => send_to_members(&registry, &msg),
                Some(NsCommand::SendToRouter(_)) => {
                    // We are the router; senders check the role first.
                    warn!(ns = %label, "send_to_router while router, dropped");
                }
                Some(NsCommand::Retry) => {}
                Some(NsCommand::Shutdown) | None => return Exit::Shutdown,
            },
        }
    }
}

/// Handle one decoded frame arriving at the router. Returns an exit to
/// propagate, if any.
fn router_frame(
    shared: &Shared,
    registry: &mut Registry,
    conns: &mut Conns,
    direct: &HashMap<u64, ChannelSender>,
    conn: u64,
    bytes: &[u8],
) -> Option<Exit> {
    let msg = match WireMessage::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(ns = %shared.config.label, "dropping malformed frame: {e}");
            return None;
        }
    };

    // Traffic on a discovery channel is surfaced as-is.
    if let Some(reply) = direct.get(&conn) {
        shared.emit(NsEvent::Direct {
            label: shared.config.label.clone(),
            msg,
            reply: reply.clone(),
        });
        return None;
    }

    let now = chrono::Utc::now().timestamp();
    match msg {
        WireMessage::Checkin {
            discovery_id,
            friendly_name,
            public_key,
        } => {
            let sender = conns.sender(conn)?.clone();
            conns.bind_address(conn, discovery_id.clone());
            let info = PeerInfo {
                address: discovery_id,
                name: friendly_name,
                public_key,
                last_seen: now,
            };
            let evicted = registry.checkin(info, Some(sender));
            for address in evicted {
                if let Some(stale) = conns.conn_for_address(&address) {
                    if stale != conn {
                        conns.remove(stale);
                    }
                }
            }
            broadcast_registry(shared, registry);
            None
        }
        WireMessage::Pong => {
            if let Some(address) = conns.address(conn) {
                registry.mark_seen(address, now);
            }
            None
        }
        WireMessage::Ping => {
            if let Some(sender) = conns.sender(conn) {
                send_frame(sender, &WireMessage::Pong);
            }
            None
        }
        other => {
            // Members must check in before any other traffic counts.
            let from = conns.address(conn)?.to_string();
            let reply = conns.sender(conn)?.clone();
            shared.emit(NsEvent::FromMember {
                label: shared.config.label.clone(),
                from,
                msg: other,
                reply,
            });
            None
        }
    }
}

async fn probe_peer_slot(shared: &Shared, conns: &mut Conns) {
    let slot_id = (shared.config.peer_slot_id)();
    // Misses are the expected case; stay quiet about them.
    if let Ok(channel) = shared.transport.connect(&slot_id).await {
        let id = conns.add(channel);
        if let Some(sender) = conns.sender(id) {
            send_frame(sender, &WireMessage::ReverseWelcome);
        }
        debug!(ns = %shared.config.label, "reverse-connected a peer-slot waiter");
    }
}

fn broadcast_registry(shared: &Shared, registry: &Registry) {
    let peers = registry.snapshot();
    send_to_members(registry, &WireMessage::Registry {
        peers: peers.clone(),
    });
    shared.emit(NsEvent::Registry {
        label: shared.config.label.clone(),
        peers,
    });
}

fn send_to_members(registry: &Registry, msg: &WireMessage) {
    for (_, conn) in registry.member_conns() {
        send_frame(conn, msg);
    }
}

fn send_frame(conn: &ChannelSender, msg: &WireMessage) {
    if let Ok(bytes) = msg.encode() {
        let _ = conn.send(bytes);
    }
}

// ---------------------------------------------------------------------------
// Member role
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_member(
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<NsCommand>,
    inbound_rx: &mut mpsc::UnboundedReceiver<Inbound>,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    conn_counter: &Arc<AtomicU64>,
    discovery: &mut Option<Endpoint>,
    channel: Channel,
    level: u32,
) -> Exit {
    let label = shared.config.label.clone();
    let mut conns = Conns::new(inbound_tx.clone(), Arc::clone(conn_counter));
    let mut direct: HashMap<u64, ChannelSender> = HashMap::new();

    let router_conn = conns.add(channel);
    let Some(router_sender) = conns.sender(router_conn).cloned() else {
        return Exit::Restart(level);
    };

    send_frame(&router_sender, &shared.checkin_message());
    shared.set_status(Role::Member, level);

    let mut checkin_timer = interval(Duration::from_secs(crate::CHECKIN_INTERVAL_SECS));
    let mut monitor_timer = interval(Duration::from_secs(LEVEL_MONITOR_INTERVAL_SECS));
    checkin_timer.tick().await;
    monitor_timer.tick().await;

    loop {
        if !shared.is_active() {
            return Exit::Shutdown;
        }
        tokio::select! {
            accepted = accept_opt(discovery) => if let Some(ch) = accepted {
                let id = conns.add(ch);
                if let Some(sender) = conns.sender(id) {
                    direct.insert(id, sender.clone());
                }
            },

            inbound = inbound_rx.recv() => match inbound {
                Some(Inbound::Frame { conn, bytes }) => {
                    let msg = match WireMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(ns = %label, "dropping malformed frame: {e}");
                            continue;
                        }
                    };
                    if conn == router_conn {
                        if let Some(exit) = member_router_frame(shared, &router_sender, msg) {
                            return exit;
                        }
                    } else if let Some(reply) = direct.get(&conn) {
                        shared.emit(NsEvent::Direct {
                            label: label.clone(),
                            msg,
                            reply: reply.clone(),
                        });
                    }
                }
                Some(Inbound::Closed { conn }) => {
                    if conn == router_conn {
                        debug!(ns = %label, "router connection lost, failing over");
                        return Exit::Restart(level);
                    }
                    direct.remove(&conn);
                    conns.remove(conn);
                }
                None => return Exit::Shutdown,
            },

            _ = checkin_timer.tick() => {
                send_frame(&router_sender, &shared.checkin_message());
            }

            _ = monitor_timer.tick(), if level > 1 => {
                if let Ok(ch) = shared.transport.connect(&(shared.config.router_id)(1)).await {
                    drop(ch);
                    info!(ns = %label, "level 1 router present, migrating down");
                    return Exit::Restart(1);
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(NsCommand::SendToRouter(msg)) => send_frame(&router_sender, &msg),
                Some(NsCommand::SendToPeer { .. }) | Some(NsCommand::Broadcast(_)) => {
                    warn!(ns = %label, "router-only command while member, dropped");
                }
                Some(NsCommand::Retry) => {}
                Some(NsCommand::Shutdown) | None => return Exit::Shutdown,
            },
        }
    }
}

/// Handle one frame from the router. Returns an exit to propagate, if any.
fn member_router_frame(
    shared: &Shared,
    router_sender: &ChannelSender,
    msg: WireMessage,
) -> Option<Exit> {
    match msg {
        WireMessage::Registry { mut peers } => {
            // A broadcast fully replaces our view, except our own entry.
            let me = shared.discovery_address();
            if !peers.iter().any(|p| p.address == me) {
                peers.push(shared.self_info(chrono::Utc::now().timestamp()));
            }
            shared.emit(NsEvent::Registry {
                label: shared.config.label.clone(),
                peers,
            });
            None
        }
        WireMessage::Ping => {
            send_frame(router_sender, &WireMessage::Pong);
            None
        }
        WireMessage::Migrate { level } => {
            debug!(ns = %shared.config.label, level, "router asked us to migrate");
            Some(Exit::Restart(level))
        }
        WireMessage::ReverseWelcome | WireMessage::Pong => None,
        other => {
            shared.emit(NsEvent::FromRouter {
                label: shared.config.label.clone(),
                msg: other,
            });
            None
        }
    }
}
