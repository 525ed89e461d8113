//! The core manager task.
//!
//! Single owner of all shared state: the identity, the contact router, the
//! rendezvous slots, the group map, and every namespace handle. External
//! callers talk to it through [`CoreHandle`] commands and observe it
//! through the [`EventBus`]; namespace engines feed it events over one
//! channel; per-connection reader tasks only forward frames. No state is
//! mutated from two tasks.

use crate::contact::{Contact, MessageContent, PendingState};
use crate::crypto::{self, Identity};
use crate::error::{Error, Result};
use crate::events::{CustomNsEvent, EventBus, GeoEvent, MessageEvent, StatusEvent};
use crate::geo::{covering_cells, Geohasher};
use crate::group::{FileAssembly, GroupState};
use crate::namespace::{
    self, custom_config, geo_config, group_config, public_ip_config, rendezvous_config, slugify,
    NamespaceHandle, NsEvent, Role, SelfInfo,
};
use crate::protocol::{self, MessageBody, PeerInfo, WireMessage};
use crate::rendezvous::{RendezvousManager, SweepAction};
use crate::signaling::{Priority, SignalingGate};
use crate::storage::{AppStore, BlobMeta, CustomNamespaceRecord, PersistedIdentity};
use crate::transport::{Channel, ChannelSender, Endpoint, Reachability, Transport};
use crate::{CONTACT_SWEEP_SECS, KEEPALIVE_SECS, RENDEZVOUS_SWEEP_SECS};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

/// How long a direct connect may take before it counts as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the rendezvous caller waits for the answer exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Static configuration for one overlay node.
#[derive(Clone)]
pub struct ManagerConfig {
    /// App prefix for every endpoint id.
    pub prefix: String,
    /// Our display name.
    pub friendly_name: String,
    /// Public IP for same-network discovery, when known.
    pub public_ip: Option<String>,
    /// External geohash implementation for proximity discovery.
    pub geohasher: Option<Arc<dyn Geohasher>>,
}

impl ManagerConfig {
    /// Minimal configuration.
    pub fn new(friendly_name: impl Into<String>) -> Self {
        Self {
            prefix: crate::DEFAULT_PREFIX.to_string(),
            friendly_name: friendly_name.into(),
            public_ip: None,
            geohasher: None,
        }
    }
}

/// Commands accepted by the running manager.
enum Command {
    SendText {
        fingerprint: String,
        text: String,
        reply: oneshot::Sender<Result<String>>,
    },
    AddContact {
        address: String,
        name: Option<String>,
    },
    AcceptContact {
        fingerprint: String,
    },
    RejectContact {
        fingerprint: String,
    },
    EditMessage {
        fingerprint: String,
        id: String,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteMessage {
        fingerprint: String,
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendFile {
        fingerprint: String,
        name: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<String>>,
    },
    CallContact {
        fingerprint: String,
        kind: crate::protocol::CallKind,
    },
    MarkRead {
        fingerprint: String,
        ts: i64,
    },
    GroupMarkRead {
        group_id: String,
        ts: i64,
    },
    SetName {
        name: String,
    },
    JoinRoom {
        name: String,
    },
    LeaveRoom {
        slug: String,
    },
    SetPosition {
        lat: f64,
        lon: f64,
    },
    CreateGroup {
        name: String,
        reply: oneshot::Sender<Result<String>>,
    },
    GroupInvite {
        group_id: String,
        fingerprint: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GroupSend {
        group_id: String,
        text: String,
        reply: oneshot::Sender<Result<String>>,
    },
    GroupKick {
        group_id: String,
        fingerprint: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GroupEditMessage {
        group_id: String,
        id: String,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GroupDeleteMessage {
        group_id: String,
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GroupSendFile {
        group_id: String,
        name: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<String>>,
    },
    GroupCallStart {
        group_id: String,
        kind: crate::protocol::CallKind,
        reply: oneshot::Sender<Result<String>>,
    },
    GroupCallJoin {
        group_id: String,
        reply: oneshot::Sender<Result<String>>,
    },
    GroupCallLeave {
        group_id: String,
    },
    GroupLeave {
        group_id: String,
    },
    Contacts {
        reply: oneshot::Sender<Vec<Contact>>,
    },
    SetOffline {
        offline: bool,
    },
    Shutdown,
}

/// Handle onto a running overlay node.
#[derive(Clone)]
pub struct CoreHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    fingerprint: String,
    address: String,
}

impl CoreHandle {
    /// Our fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Our transport address this session.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Queue a text message to a contact.
    pub async fn send_text(&self, fingerprint: &str, text: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendText {
            fingerprint: fingerprint.to_string(),
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Start a contact handshake with a transport address.
    pub fn add_contact(&self, address: &str, name: Option<String>) -> Result<()> {
        self.send(Command::AddContact {
            address: address.to_string(),
            name,
        })
    }

    /// Accept a pending incoming contact request.
    pub fn accept_contact(&self, fingerprint: &str) -> Result<()> {
        self.send(Command::AcceptContact {
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Reject a pending incoming contact request.
    pub fn reject_contact(&self, fingerprint: &str) -> Result<()> {
        self.send(Command::RejectContact {
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Edit one of our sent messages.
    pub async fn edit_message(&self, fingerprint: &str, id: &str, text: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::EditMessage {
            fingerprint: fingerprint.to_string(),
            id: id.to_string(),
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Delete one of our sent messages.
    pub async fn delete_message(&self, fingerprint: &str, id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DeleteMessage {
            fingerprint: fingerprint.to_string(),
            id: id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Send a file to a contact. Returns the transfer id.
    pub async fn send_file(
        &self,
        fingerprint: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendFile {
            fingerprint: fingerprint.to_string(),
            name: name.to_string(),
            bytes,
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Ring a contact (signaling only; media is the transport's business).
    pub fn call_contact(&self, fingerprint: &str, kind: crate::protocol::CallKind) -> Result<()> {
        self.send(Command::CallContact {
            fingerprint: fingerprint.to_string(),
            kind,
        })
    }

    /// Record how far we have read a chat.
    pub fn mark_read(&self, fingerprint: &str, ts: i64) -> Result<()> {
        self.send(Command::MarkRead {
            fingerprint: fingerprint.to_string(),
            ts,
        })
    }

    /// Record how far we have read a group.
    pub fn group_mark_read(&self, group_id: &str, ts: i64) -> Result<()> {
        self.send(Command::GroupMarkRead {
            group_id: group_id.to_string(),
            ts,
        })
    }

    /// Edit one of our group messages.
    pub async fn group_edit_message(&self, group_id: &str, id: &str, text: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupEditMessage {
            group_id: group_id.to_string(),
            id: id.to_string(),
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Delete one of our group messages.
    pub async fn group_delete_message(&self, group_id: &str, id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupDeleteMessage {
            group_id: group_id.to_string(),
            id: id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Send a file to a group. Returns the transfer id.
    pub async fn group_send_file(
        &self,
        group_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupSendFile {
            group_id: group_id.to_string(),
            name: name.to_string(),
            bytes,
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Start a call in a group. Returns the call id.
    pub async fn group_call_start(
        &self,
        group_id: &str,
        kind: crate::protocol::CallKind,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupCallStart {
            group_id: group_id.to_string(),
            kind,
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Join the active call in a group. Returns the call id.
    pub async fn group_call_join(&self, group_id: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupCallJoin {
            group_id: group_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Leave the active call in a group.
    pub fn group_call_leave(&self, group_id: &str) -> Result<()> {
        self.send(Command::GroupCallLeave {
            group_id: group_id.to_string(),
        })
    }

    /// Change our display name and notify connected peers.
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.send(Command::SetName {
            name: name.to_string(),
        })
    }

    /// Join (and persist) a named room.
    pub fn join_room(&self, name: &str) -> Result<()> {
        self.send(Command::JoinRoom {
            name: name.to_string(),
        })
    }

    /// Leave a named room.
    pub fn leave_room(&self, slug: &str) -> Result<()> {
        self.send(Command::LeaveRoom {
            slug: slug.to_string(),
        })
    }

    /// Update our position and re-enroll geo namespaces.
    pub fn set_position(&self, lat: f64, lon: f64) -> Result<()> {
        self.send(Command::SetPosition { lat, lon })
    }

    /// Create a group; returns the group id.
    pub async fn create_group(&self, name: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateGroup {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Invite a contact into a group.
    pub async fn group_invite(&self, group_id: &str, fingerprint: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupInvite {
            group_id: group_id.to_string(),
            fingerprint: fingerprint.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Send a text message to a group.
    pub async fn group_send(&self, group_id: &str, text: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupSend {
            group_id: group_id.to_string(),
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Kick a member (admin only).
    pub async fn group_kick(&self, group_id: &str, fingerprint: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupKick {
            group_id: group_id.to_string(),
            fingerprint: fingerprint.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))?
    }

    /// Leave a group.
    pub fn group_leave(&self, group_id: &str) -> Result<()> {
        self.send(Command::GroupLeave {
            group_id: group_id.to_string(),
        })
    }

    /// Snapshot of all contacts.
    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Contacts { reply })?;
        rx.await.map_err(|_| Error::State("manager gone".into()))
    }

    /// Toggle user-initiated offline mode.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        self.send(Command::SetOffline { offline })
    }

    /// Stop the node.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::State("manager gone".into()))
    }
}

/// Internal messages from helper tasks into the manager loop.
enum Internal {
    DirectFrame { conn: u64, bytes: Vec<u8> },
    DirectClosed { conn: u64 },
    ConnectResult {
        fingerprint: String,
        address: String,
        result: std::result::Result<Channel, ()>,
        handshake: bool,
    },
    RvzReply {
        fingerprint: String,
        bytes: Vec<u8>,
    },
    RvzCallerDone {
        fingerprint: String,
    },
}

struct DirectConn {
    sender: ChannelSender,
    fingerprint: Option<String>,
    /// Pending-handshake peers are keyed by address until a key arrives.
    address: Option<String>,
}

/// The running node.
pub struct CoreManager {
    config: ManagerConfig,
    identity: Identity,
    store: AppStore,
    bus: EventBus,
    gate: SignalingGate,
    transport: Arc<dyn Transport>,
    pid: String,

    ir: crate::router::IdentityRouter,
    rvz: RendezvousManager,
    groups: HashMap<String, GroupState>,
    namespaces: HashMap<String, NamespaceHandle>,

    conns: HashMap<u64, DirectConn>,
    next_conn: u64,
    files: HashMap<(u64, String), FileAssembly>,

    ns_tx: mpsc::UnboundedSender<NsEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl CoreManager {
    /// Boot the node: load or create the identity, claim our transport
    /// address, start persisted namespaces, and spawn the manager loop.
    pub async fn start(
        config: ManagerConfig,
        store: AppStore,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn Reachability>,
    ) -> Result<CoreHandle> {
        let identity = match store.identity_secret()? {
            Some(secret) => Identity::from_secret_bytes(&secret)?,
            None => {
                let identity = Identity::generate();
                store.save_identity(&PersistedIdentity {
                    secret_b64: BASE64.encode(identity.secret_bytes().as_slice()),
                    public_b64: identity.public_key_b64().to_string(),
                })?;
                info!(fp = %identity.fingerprint(), "generated new identity");
                identity
            }
        };

        let bus = EventBus::default();
        let gate = SignalingGate::spawn(probe);

        // Claim our persistent endpoint first; it outranks every election.
        let pid = format!("{}-{}", config.prefix, crypto::random_token());
        let (tx, rx) = oneshot::channel();
        {
            let transport = Arc::clone(&transport);
            let id = pid.clone();
            gate.schedule(Priority::High, || true, move || async move {
                let _ = tx.send(transport.create_endpoint(&id).await);
            });
        }
        let endpoint = match rx.await {
            Ok(Ok(endpoint)) => {
                gate.report_success();
                endpoint
            }
            Ok(Err(e)) => {
                gate.report_failure().await;
                return Err(e);
            }
            Err(_) => return Err(Error::State("gate stopped during startup".into())),
        };
        store.save_pid(&pid)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ns_tx, ns_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let ir = crate::router::IdentityRouter::load(
            store.contacts()?,
            {
                let mut chats = HashMap::new();
                for fp in store.contacts()?.keys() {
                    chats.insert(fp.clone(), store.chat(fp)?);
                }
                chats
            },
            bus.clone(),
        );

        let mut manager = CoreManager {
            config,
            identity,
            store,
            bus: bus.clone(),
            gate,
            transport,
            pid: pid.clone(),
            ir,
            rvz: RendezvousManager::new(),
            groups: HashMap::new(),
            namespaces: HashMap::new(),
            conns: HashMap::new(),
            next_conn: 0,
            files: HashMap::new(),
            ns_tx,
            internal_tx,
        };

        manager.restore_groups()?;
        if !manager.store.ns_offline()? && !manager.store.offline()? {
            manager.start_discovery_namespaces()?;
        }

        let fingerprint = manager.identity.fingerprint().to_string();
        bus.status(StatusEvent::Started {
            address: pid.clone(),
            fingerprint: fingerprint.clone(),
        });

        tokio::spawn(manager.run(endpoint, cmd_rx, ns_rx, internal_rx));

        Ok(CoreHandle {
            cmd_tx,
            bus,
            fingerprint,
            address: pid,
        })
    }

    fn restore_groups(&mut self) -> Result<()> {
        for info in self.store.groups()? {
            let group_id = info.group_id.clone();
            let log = self.store.group_messages(&group_id)?;
            match GroupState::restore(
                info,
                log,
                self.identity.fingerprint(),
                &self.config.friendly_name,
                self.bus.clone(),
            ) {
                Ok(mut group) => {
                    let ns = self.spawn_namespace(group_config(&self.config.prefix, &group_id));
                    group.attach(ns);
                    self.groups.insert(group_id, group);
                }
                Err(e) => warn!(group = %group_id, "group restore failed: {e}"),
            }
        }
        Ok(())
    }

    fn start_discovery_namespaces(&mut self) -> Result<()> {
        if let Some(ip) = self.config.public_ip.clone() {
            let config = public_ip_config(&self.config.prefix, &ip);
            let handle = self.spawn_namespace(config);
            self.namespaces.insert(handle.label().to_string(), handle);
        }
        for record in self.store.custom_namespaces()? {
            if record.offline {
                continue;
            }
            let config = custom_config(&self.config.prefix, &record.slug);
            let handle = self.spawn_namespace(config);
            self.namespaces.insert(handle.label().to_string(), handle);
        }
        Ok(())
    }

    fn spawn_namespace(&self, config: namespace::NsConfig) -> NamespaceHandle {
        namespace::spawn(
            config,
            SelfInfo {
                discovery_uuid: self.store.discovery_uuid().unwrap_or_else(|_| crypto::random_token()),
                friendly_name: self.config.friendly_name.clone(),
                public_key: Some(self.identity.public_key_b64().to_string()),
            },
            Arc::clone(&self.transport),
            self.gate.clone(),
            self.ns_tx.clone(),
        )
    }

    async fn run(
        mut self,
        endpoint: Endpoint,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut ns_rx: mpsc::UnboundedReceiver<NsEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut endpoint = Some(endpoint);
        let mut contact_sweep = interval(Duration::from_secs(CONTACT_SWEEP_SECS));
        let mut rvz_sweep = interval(Duration::from_secs(RENDEZVOUS_SWEEP_SECS));
        let mut keepalive = interval(Duration::from_secs(KEEPALIVE_SECS));
        contact_sweep.tick().await;
        keepalive.tick().await;
        // The rendezvous sweep runs once at startup on purpose.

        loop {
            tokio::select! {
                accepted = accept_opt(&mut endpoint) => match accepted {
                    Some(channel) => {
                        self.register_direct(channel, None, None);
                    }
                    None => {
                        warn!("transport endpoint lost");
                        endpoint = None;
                        self.bus.status(StatusEvent::NetworkDown);
                    }
                },

                Some(internal) = internal_rx.recv() => self.handle_internal(internal),

                Some(event) = ns_rx.recv() => self.handle_ns_event(event),

                Some(cmd) = cmd_rx.recv() => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }

                _ = contact_sweep.tick() => self.contact_sweep(),

                _ = rvz_sweep.tick() => self.rendezvous_sweep(),

                _ = keepalive.tick() => {
                    let frame = WireMessage::Ping.encode().unwrap_or_default();
                    for conn in self.conns.values() {
                        let _ = conn.sender.send(frame.clone());
                    }
                }
            }
        }

        for (_, handle) in self.namespaces.drain() {
            handle.shutdown();
        }
        for group in self.groups.values() {
            if let Some(ns) = group.namespace() {
                ns.shutdown();
            }
        }
        self.rvz.teardown_all();
        self.gate.shutdown();
        self.bus.status(StatusEvent::Stopped);
        info!("core manager stopped");
    }

    // -----------------------------------------------------------------------
    // Direct channels
    // -----------------------------------------------------------------------

    fn register_direct(
        &mut self,
        channel: Channel,
        fingerprint: Option<String>,
        address: Option<String>,
    ) -> u64 {
        let conn = self.next_conn;
        self.next_conn += 1;
        let (sender, mut receiver) = channel.split();
        self.conns.insert(
            conn,
            DirectConn {
                sender,
                fingerprint,
                address,
            },
        );
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                if tx.send(Internal::DirectFrame { conn, bytes }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Internal::DirectClosed { conn });
        });
        conn
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::DirectFrame { conn, bytes } => {
                match WireMessage::decode(&bytes) {
                    Ok(msg) => self.handle_direct(conn, msg),
                    Err(e) => debug!("dropping malformed direct frame: {e}"),
                }
            }
            Internal::DirectClosed { conn } => {
                if let Some(gone) = self.conns.remove(&conn) {
                    if let Some(fp) = gone.fingerprint {
                        self.ir.connection_closed(&fp);
                    }
                }
            }
            Internal::ConnectResult {
                fingerprint,
                address,
                result,
                handshake,
            } => match result {
                Ok(channel) => {
                    let now = chrono::Utc::now().timestamp();
                    let conn =
                        self.register_direct(channel, Some(fingerprint.clone()), Some(address.clone()));
                    let sender = match self.conns.get(&conn) {
                        Some(c) => c.sender.clone(),
                        None => return,
                    };
                    if handshake {
                        // New contact: open with a request instead of hello.
                        let ts = now;
                        let msg = WireMessage::Request {
                            friendly_name: self.config.friendly_name.clone(),
                            public_key: self.identity.public_key_b64().to_string(),
                            address: self.pid.clone(),
                            ts,
                            signature: self
                                .identity
                                .sign_b64(&protocol::signed_envelope(&self.pid, ts)),
                        };
                        send_frame(&sender, &msg);
                    } else {
                        self.send_hello(&sender);
                        self.ir
                            .register_connection(&self.identity, &fingerprint, sender, now);
                        self.persist_chat(&fingerprint);
                    }
                }
                Err(()) => {
                    if self.ir.connect_failed(&fingerprint) {
                        debug!(contact = %fingerprint, "direct retries exhausted, rendezvous takes over");
                        self.rendezvous_sweep();
                    }
                }
            },
            Internal::RvzReply { fingerprint, bytes } => {
                if let Ok(WireMessage::RvzExchange {
                    address,
                    friendly_name,
                    public_key,
                    ts,
                    signature,
                }) = WireMessage::decode(&bytes)
                {
                    self.handle_rvz_exchange(
                        &fingerprint,
                        address,
                        friendly_name,
                        public_key,
                        ts,
                        signature,
                        None,
                    );
                }
            }
            Internal::RvzCallerDone { fingerprint } => {
                self.rvz.teardown(&fingerprint);
            }
        }
    }

    fn send_hello(&self, sender: &ChannelSender) {
        let ts = chrono::Utc::now().timestamp();
        send_frame(
            sender,
            &WireMessage::Hello {
                friendly_name: self.config.friendly_name.clone(),
                public_key: self.identity.public_key_b64().to_string(),
                ts,
                signature: self
                    .identity
                    .sign_b64(&protocol::signed_envelope("hello", ts)),
            },
        );
    }

    fn handle_direct(&mut self, conn: u64, msg: WireMessage) {
        let now = chrono::Utc::now().timestamp();
        match msg {
            WireMessage::Request {
                friendly_name,
                public_key,
                address,
                ts,
                signature,
            } => {
                if protocol::verify_signed_address(&public_key, &address, ts, &signature).is_err() {
                    warn!("contact request with bad signature dropped");
                    return;
                }
                let fp = match crypto::fingerprint_of(&public_key) {
                    Ok(fp) => fp,
                    Err(_) => return,
                };
                let mut contact = self
                    .ir
                    .contact(&fp)
                    .cloned()
                    .unwrap_or_else(|| Contact::new(fp.clone(), friendly_name.clone()));
                contact.name = friendly_name;
                contact.public_key = Some(public_key);
                contact.touch_address(&address);
                if contact.pending == PendingState::Outgoing {
                    // Crossed requests: both sides asked; treat as accepted.
                    contact.pending = PendingState::None;
                } else if contact.shared_key_fp.is_none() {
                    contact.pending = PendingState::Incoming;
                }
                self.ir.upsert_contact(contact);
                if let Some(c) = self.conns.get_mut(&conn) {
                    c.fingerprint = Some(fp.clone());
                    c.address = Some(address);
                }
                self.persist_contacts();
                self.bus.status(StatusEvent::ContactOnline { fingerprint: fp });
            }
            WireMessage::Accepted { address, .. } => {
                // Our earlier request was approved; confirm and wait for
                // the peer's hello to learn their key.
                let sender = match self.conns.get(&conn) {
                    Some(c) => c.sender.clone(),
                    None => return,
                };
                if let Some(c) = self.conns.get_mut(&conn) {
                    c.address = Some(address);
                }
                let discovery_uuid = self
                    .store
                    .discovery_uuid()
                    .unwrap_or_else(|_| crypto::random_token());
                send_frame(
                    &sender,
                    &WireMessage::Confirm {
                        address: self.pid.clone(),
                        friendly_name: self.config.friendly_name.clone(),
                        discovery_uuid,
                        public_key: self.identity.public_key_b64().to_string(),
                    },
                );
            }
            WireMessage::Rejected => {
                if let Some(address) = self.conns.get(&conn).and_then(|c| c.address.clone()) {
                    debug!(address = %address, "contact request rejected");
                    // The pending record is still keyed by address.
                    self.ir.remove_contact(&address);
                    self.persist_contacts();
                }
            }
            WireMessage::Confirm {
                address,
                friendly_name,
                public_key,
                ..
            } => {
                let old_key = self
                    .conns
                    .get(&conn)
                    .and_then(|c| c.fingerprint.clone())
                    .unwrap_or_else(|| address.clone());
                if let Ok(fp) = self.ir.migrate(&old_key, &public_key, &address, now) {
                    if let Some(contact) = self.ir.contact_mut(&fp) {
                        contact.name = friendly_name;
                        contact.pending = PendingState::None;
                    }
                    self.finish_session(conn, &fp, now);
                }
            }
            WireMessage::Hello {
                friendly_name,
                public_key,
                ts,
                signature,
            } => {
                if protocol::verify_signed_address(&public_key, "hello", ts, &signature).is_err() {
                    warn!("hello with bad signature dropped");
                    return;
                }
                // The channel may so far be filed under an address-keyed
                // pending record; the verified key migrates it.
                let address = self
                    .conns
                    .get(&conn)
                    .and_then(|c| c.address.clone())
                    .unwrap_or_default();
                let Ok(fp) = crypto::fingerprint_of(&public_key) else {
                    return;
                };
                let merge_key = if address.is_empty() {
                    fp.clone()
                } else {
                    address.clone()
                };
                if let Ok(fp) = self.ir.migrate(&merge_key, &public_key, &address, now) {
                    if let Some(contact) = self.ir.contact_mut(&fp) {
                        if contact.name == contact.fingerprint {
                            contact.name = friendly_name;
                        }
                        contact.pending = PendingState::None;
                    }
                    self.finish_session(conn, &fp, now);
                }
            }
            WireMessage::Message { id, ts, body } => {
                let Some(fp) = self.conn_fingerprint(conn) else {
                    return;
                };
                if let Some(content) = self.decrypt_body(&fp, body) {
                    self.ir.store_incoming(&fp, &id, content, ts);
                    self.reply_to(conn, &WireMessage::MessageAck { id });
                    self.persist_chat(&fp);
                }
            }
            WireMessage::MessageAck { id } => {
                if let Some(fp) = self.conn_fingerprint(conn) {
                    self.ir.handle_ack(&fp, &id);
                    self.persist_chat(&fp);
                }
            }
            WireMessage::MessageEdit { id, body } => {
                let Some(fp) = self.conn_fingerprint(conn) else {
                    return;
                };
                if let Some(content) = self.decrypt_body(&fp, body) {
                    self.ir.apply_edit(&fp, &id, content);
                    self.persist_chat(&fp);
                }
            }
            WireMessage::MessageDelete { id, tid } => {
                let Some(fp) = self.conn_fingerprint(conn) else {
                    return;
                };
                self.ir.apply_delete(&fp, &id);
                if let Some(tid) = tid {
                    let _ = self.store.raw().delete_blob(&tid);
                }
                self.persist_chat(&fp);
            }
            WireMessage::FileAck { tid } => {
                if let Some(fp) = self.conn_fingerprint(conn) {
                    self.ir.handle_ack(&fp, &tid);
                    self.persist_chat(&fp);
                }
            }
            WireMessage::NameUpdate { name } => {
                if let Some(fp) = self.conn_fingerprint(conn) {
                    if let Some(contact) = self.ir.contact_mut(&fp) {
                        contact.name = name.clone();
                    }
                    self.persist_contacts();
                    self.bus.message(MessageEvent::NameUpdated {
                        fingerprint: fp,
                        name,
                    });
                }
            }
            WireMessage::FileStart {
                tid, name, size, total,
            } => {
                let from_fp = self.conn_fingerprint(conn);
                self.files.insert(
                    (conn, tid.clone()),
                    FileAssembly::new(tid, name, size, total, from_fp),
                );
            }
            WireMessage::FileChunk { tid, index, bytes } => {
                if let Some(assembly) = self.files.get_mut(&(conn, tid.clone())) {
                    if let Err(e) = assembly.add_chunk(index, &bytes) {
                        debug!(tid = %tid, "file chunk rejected: {e}");
                    }
                }
            }
            WireMessage::FileEnd { tid } => {
                let Some(assembly) = self.files.remove(&(conn, tid.clone())) else {
                    return;
                };
                let Some(fp) = self.conn_fingerprint(conn) else {
                    return;
                };
                match assembly.assemble() {
                    Ok(bytes) => {
                        let meta = BlobMeta {
                            name: assembly.name.clone(),
                            size: assembly.size,
                            received_at: now,
                        };
                        if let Err(e) = self.store.raw().put_blob(&tid, &meta, &bytes) {
                            warn!(tid = %tid, "blob store failed: {e}");
                        }
                        self.ir.store_incoming(
                            &fp,
                            &tid,
                            MessageContent::File {
                                tid: tid.clone(),
                                name: assembly.name.clone(),
                                size: assembly.size,
                            },
                            now,
                        );
                        self.persist_chat(&fp);
                        self.reply_to(conn, &WireMessage::FileAck { tid: tid.clone() });
                        self.bus.message(MessageEvent::FileReceived {
                            fingerprint: fp,
                            tid,
                            name: assembly.name,
                            size: assembly.size,
                        });
                    }
                    Err(e) => warn!(tid = %tid, "file assembly failed: {e}"),
                }
            }
            WireMessage::RvzExchange {
                address,
                friendly_name,
                public_key,
                ts,
                signature,
            } => {
                // Arrived on a direct channel (caller side reply path goes
                // through RvzReply instead).
                let reply = self.conns.get(&conn).map(|c| c.sender.clone());
                let fp = crypto::fingerprint_of(&public_key).unwrap_or_default();
                self.handle_rvz_exchange(
                    &fp,
                    address,
                    friendly_name,
                    public_key,
                    ts,
                    signature,
                    reply.as_ref(),
                );
            }
            WireMessage::Ping => self.reply_to(conn, &WireMessage::Pong),
            WireMessage::Pong => {
                if let Some(fp) = self.conn_fingerprint(conn) {
                    if let Some(contact) = self.ir.contact_mut(&fp) {
                        contact.last_seen = now;
                    }
                }
            }
            WireMessage::CallNotify { kind } => {
                if let Some(fp) = self.conn_fingerprint(conn) {
                    self.reply_to(conn, &WireMessage::CallReceived { kind });
                    self.ir.store_incoming(
                        &fp,
                        &crypto::random_token(),
                        MessageContent::CallLog {
                            kind,
                            duration_secs: 0,
                        },
                        now,
                    );
                    self.persist_chat(&fp);
                }
            }
            WireMessage::CallReceived { .. }
            | WireMessage::CallAnswered { .. }
            | WireMessage::CallRejected { .. } => {
                // Media negotiation is the transport layer's business.
            }
            WireMessage::GroupInvite {
                group_id,
                info,
                inviter_fp,
                group_key,
                ..
            } => {
                if self.groups.contains_key(&group_id) {
                    return;
                }
                let Some(wrapped) = group_key else {
                    warn!(group = %group_id, "invite without wrapped key dropped");
                    return;
                };
                match GroupState::from_invite(
                    &self.identity,
                    &self.config.friendly_name,
                    Some(self.pid.clone()),
                    info,
                    &inviter_fp,
                    &wrapped,
                    self.bus.clone(),
                    now,
                ) {
                    Ok(mut group) => {
                        let ns =
                            self.spawn_namespace(group_config(&self.config.prefix, &group_id));
                        group.attach(ns);
                        self.groups.insert(group_id.clone(), group);
                        self.persist_group(&group_id);
                    }
                    Err(e) => warn!(group = %group_id, "invite rejected: {e}"),
                }
            }
            other => {
                debug!("unhandled direct message: {other:?}");
            }
        }
    }

    /// Verify, decrypt, and parse a direct message body. Plaintext is
    /// accepted only while no pairwise key exists yet.
    fn decrypt_body(&mut self, fingerprint: &str, body: MessageBody) -> Option<MessageContent> {
        match body {
            MessageBody::Encrypted { payload, sig, .. } => {
                let pk = self.ir.contact(fingerprint)?.public_key.clone()?;
                if crypto::verify_b64(&pk, &sig, payload.ct.as_bytes()).is_err() {
                    warn!(contact = %fingerprint, "message signature verify failed");
                    return None;
                }
                let key = self.ir.shared_key(&self.identity, fingerprint).ok()?;
                match crypto::decrypt(key.as_bytes(), &payload) {
                    Ok(plain) => serde_json::from_slice(&plain).ok(),
                    Err(e) => {
                        warn!(contact = %fingerprint, "decrypt failed: {e}");
                        None
                    }
                }
            }
            MessageBody::Plain { content } => {
                if self.ir.shared_key(&self.identity, fingerprint).is_ok() {
                    warn!(contact = %fingerprint, "plaintext after E2E established, dropped");
                    return None;
                }
                Some(MessageContent::Text { body: content })
            }
        }
    }

    fn finish_session(&mut self, conn: u64, fingerprint: &str, now: i64) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.fingerprint = Some(fingerprint.to_string());
        }
        let sender = match self.conns.get(&conn) {
            Some(c) => c.sender.clone(),
            None => return,
        };
        self.send_hello(&sender);
        self.ir
            .register_connection(&self.identity, fingerprint, sender, now);
        self.persist_contacts();
        self.persist_chat(fingerprint);
    }

    fn conn_fingerprint(&self, conn: u64) -> Option<String> {
        self.conns.get(&conn).and_then(|c| c.fingerprint.clone())
    }

    fn reply_to(&self, conn: u64, msg: &WireMessage) {
        if let Some(c) = self.conns.get(&conn) {
            send_frame(&c.sender, msg);
        }
    }

    // -----------------------------------------------------------------------
    // Namespace events
    // -----------------------------------------------------------------------

    fn handle_ns_event(&mut self, event: NsEvent) {
        match event {
            NsEvent::Status { label, role, level } => {
                self.bus.status(StatusEvent::Namespace {
                    label: label.clone(),
                    role,
                    level,
                });
                if let Some(slug) = label.strip_prefix("custom:") {
                    self.bus.custom_ns(CustomNsEvent::Status {
                        slug: slug.to_string(),
                        role,
                        level,
                    });
                }
                if let Some(group_id) = label.strip_prefix("group:") {
                    if role == Role::Member {
                        let checkin = self.groups.get(group_id).map(|g| {
                            g.checkin_message(&self.identity, &self.pid)
                        });
                        if let (Some(checkin), Some(group)) = (checkin, self.groups.get(group_id)) {
                            if let Some(ns) = group.namespace() {
                                let _ = ns.send_to_router(checkin);
                            }
                        }
                    }
                }
            }
            NsEvent::Registry { label, peers } => self.handle_registry(label, peers),
            NsEvent::FromMember { label, msg, reply, .. } => {
                if let Some(group_id) = label.strip_prefix("group:").map(String::from) {
                    let now = chrono::Utc::now().timestamp();
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        let completed =
                            group.handle_from_member(&self.identity, msg, Some(&reply), now);
                        self.after_group_activity(&group_id, completed);
                    }
                }
            }
            NsEvent::FromRouter { label, msg } => {
                if let Some(group_id) = label.strip_prefix("group:").map(String::from) {
                    let now = chrono::Utc::now().timestamp();
                    let mut kicked = false;
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        if matches!(msg, WireMessage::GroupKicked) {
                            kicked = true;
                        }
                        let completed = group.handle_from_router(&self.identity, msg, now);
                        self.after_group_activity(&group_id, completed);
                    }
                    if kicked {
                        self.drop_group(&group_id);
                    }
                }
            }
            NsEvent::Direct { label, msg, reply } => {
                if label.starts_with("rvz:") {
                    if let WireMessage::RvzExchange {
                        address,
                        friendly_name,
                        public_key,
                        ts,
                        signature,
                    } = msg
                    {
                        let fp = match self.rvz.slot_for_label(&label) {
                            Some(slot) => slot.fingerprint.clone(),
                            None => crypto::fingerprint_of(&public_key).unwrap_or_default(),
                        };
                        self.handle_rvz_exchange(
                            &fp,
                            address,
                            friendly_name,
                            public_key,
                            ts,
                            signature,
                            Some(&reply),
                        );
                    }
                } else {
                    debug!(ns = %label, "direct namespace traffic: {msg:?}");
                }
            }
            NsEvent::Offline { label } => {
                warn!(ns = %label, "namespace exhausted all levels");
            }
        }
    }

    fn handle_registry(&mut self, label: String, peers: Vec<PeerInfo>) {
        let now = chrono::Utc::now().timestamp();

        if label.starts_with("rvz:") {
            self.rendezvous_registry(&label, &peers);
            return;
        }

        for peer in &peers {
            let Some(pk) = &peer.public_key else {
                continue;
            };
            if pk == self.identity.public_key_b64() {
                continue;
            }
            match crypto::fingerprint_of(pk) {
                Ok(fp) if self.ir.contact(&fp).is_some() => {
                    // A saved contact is on this namespace: presence.
                    if let Some(contact) = self.ir.contact_mut(&fp) {
                        contact.last_seen = now;
                    }
                    self.bus.status(StatusEvent::ContactOnline { fingerprint: fp });
                }
                _ => {
                    self.bus.status(StatusEvent::DiscoveryCandidate {
                        label: label.clone(),
                        peer: peer.clone(),
                    });
                    if let Some(slug) = label.strip_prefix("custom:") {
                        self.bus.custom_ns(CustomNsEvent::PeerSeen {
                            slug: slug.to_string(),
                            peer: peer.clone(),
                        });
                    }
                    if let Some(cell) = label.strip_prefix("geo:") {
                        self.bus.geo(GeoEvent::PeerNearby {
                            cell: cell.to_string(),
                            peer: peer.clone(),
                        });
                    }
                }
            }
        }
    }

    fn rendezvous_registry(&mut self, label: &str, peers: &[PeerInfo]) {
        let Some(slot) = self.rvz.slot_for_label(label) else {
            return;
        };
        let fingerprint = slot.fingerprint.clone();
        let Some(target_pk) = self
            .ir
            .contact(&fingerprint)
            .and_then(|c| c.public_key.clone())
        else {
            return;
        };
        let Some(peer) = peers
            .iter()
            .find(|p| p.public_key.as_deref() == Some(target_pk.as_str()))
        else {
            return;
        };

        // Found them. Open a direct channel to their namespace discovery
        // address and run the signed address exchange.
        let address = peer.address.clone();
        let transport = Arc::clone(&self.transport);
        let internal = self.internal_tx.clone();
        let ts = chrono::Utc::now().timestamp();
        let exchange = WireMessage::RvzExchange {
            address: self.pid.clone(),
            friendly_name: self.config.friendly_name.clone(),
            public_key: self.identity.public_key_b64().to_string(),
            ts,
            signature: self
                .identity
                .sign_b64(&protocol::signed_envelope(&self.pid, ts)),
        };
        debug!(contact = %fingerprint, "rendezvous match, exchanging addresses");
        tokio::spawn(async move {
            let Ok(Ok(mut channel)) = timeout(CONNECT_TIMEOUT, transport.connect(&address)).await
            else {
                return;
            };
            if let Ok(bytes) = exchange.encode() {
                let _ = channel.send(bytes);
            }
            if let Ok(Some(bytes)) = timeout(EXCHANGE_TIMEOUT, channel.recv()).await {
                let _ = internal.send(Internal::RvzReply {
                    fingerprint: fingerprint.clone(),
                    bytes,
                });
            }
            let _ = internal.send(Internal::RvzCallerDone { fingerprint });
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_rvz_exchange(
        &mut self,
        fingerprint: &str,
        address: String,
        friendly_name: String,
        public_key: String,
        ts: i64,
        signature: String,
        reply: Option<&ChannelSender>,
    ) {
        if protocol::verify_signed_address(&public_key, &address, ts, &signature).is_err() {
            warn!("rendezvous exchange with bad signature dropped");
            return;
        }
        let now = chrono::Utc::now().timestamp();
        let Ok(fp) = self.ir.migrate(fingerprint, &public_key, &address, now) else {
            return;
        };
        if let Some(contact) = self.ir.contact_mut(&fp) {
            contact.name = friendly_name;
        }
        self.persist_contacts();
        info!(contact = %fp, "rendezvous recovered a fresh address");

        // Answer exactly once, then the slot is done.
        if let Some(reply) = reply {
            if self.rvz.mark_answered(&fp) {
                let ts = chrono::Utc::now().timestamp();
                send_frame(
                    reply,
                    &WireMessage::RvzExchange {
                        address: self.pid.clone(),
                        friendly_name: self.config.friendly_name.clone(),
                        public_key: self.identity.public_key_b64().to_string(),
                        ts,
                        signature: self
                            .identity
                            .sign_b64(&protocol::signed_envelope(&self.pid, ts)),
                    },
                );
            }
        }
        self.rvz.teardown(&fp);
        self.connect_contact(&fp, false);
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn contact_sweep(&mut self) {
        let now = chrono::Utc::now().timestamp();
        let stale = self.ir.ack_sweep(now);
        for fp in stale {
            self.connect_contact(&fp, false);
        }
        for (fp, _address) in self.ir.sweep_candidates() {
            self.connect_contact(&fp, false);
        }
    }

    fn rendezvous_sweep(&mut self) {
        if self.gate.is_network_down() {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        let offline = self.ir.rendezvous_candidates();
        let identity = &self.identity;
        // Borrow juggling: collect the keys first, the sweep closure only
        // reads them.
        let mut keys = HashMap::new();
        for fp in &offline {
            if let Ok(key) = self.ir.shared_key(identity, fp) {
                keys.insert(fp.clone(), key);
            }
        }
        let actions = self
            .rvz
            .sweep(now, &offline, |fp| keys.get(fp).cloned());
        for action in actions {
            let (fingerprint, slug, window) = match action {
                SweepAction::Activate {
                    fingerprint,
                    slug,
                    window,
                }
                | SweepAction::Rotate {
                    fingerprint,
                    slug,
                    window,
                } => (fingerprint, slug, window),
            };
            let handle = self.spawn_namespace(rendezvous_config(&self.config.prefix, &slug));
            self.rvz.register(fingerprint, window, slug, handle);
        }
    }

    fn connect_contact(&mut self, fingerprint: &str, handshake: bool) {
        if self.ir.is_connected(fingerprint) {
            return;
        }
        let Some(address) = self
            .ir
            .contact(fingerprint)
            .and_then(|c| c.current_address.clone())
        else {
            return;
        };
        if !self.ir.begin_connect(fingerprint) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let internal = self.internal_tx.clone();
        let fingerprint = fingerprint.to_string();
        tokio::spawn(async move {
            let result = match timeout(CONNECT_TIMEOUT, transport.connect(&address)).await {
                Ok(Ok(channel)) => Ok(channel),
                _ => Err(()),
            };
            let _ = internal.send(Internal::ConnectResult {
                fingerprint,
                address,
                result,
                handshake,
            });
        });
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Returns true when the manager should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        let now = chrono::Utc::now().timestamp();
        match cmd {
            Command::SendText {
                fingerprint,
                text,
                reply,
            } => {
                let result = self.ir.send_text(&self.identity, &fingerprint, text, now);
                if result.is_ok() {
                    self.persist_chat(&fingerprint);
                    if !self.ir.is_connected(&fingerprint) {
                        self.connect_contact(&fingerprint, false);
                    }
                }
                let _ = reply.send(result);
            }
            Command::AddContact { address, name } => {
                // Address-keyed pending record until the peer's key arrives.
                let mut contact = Contact::new(address.clone(), name.unwrap_or_else(|| address.clone()));
                contact.touch_address(&address);
                contact.pending = PendingState::Outgoing;
                self.ir.upsert_contact(contact);
                self.persist_contacts();

                let transport = Arc::clone(&self.transport);
                let internal = self.internal_tx.clone();
                let key = address.clone();
                tokio::spawn(async move {
                    let result = match timeout(CONNECT_TIMEOUT, transport.connect(&address)).await {
                        Ok(Ok(channel)) => Ok(channel),
                        _ => Err(()),
                    };
                    let _ = internal.send(Internal::ConnectResult {
                        fingerprint: key,
                        address,
                        result,
                        handshake: true,
                    });
                });
            }
            Command::AcceptContact { fingerprint } => {
                let conn = self
                    .conns
                    .iter()
                    .find(|(_, c)| c.fingerprint.as_deref() == Some(fingerprint.as_str()))
                    .map(|(id, _)| *id);
                if let Some(contact) = self.ir.contact_mut(&fingerprint) {
                    contact.pending = PendingState::None;
                }
                self.persist_contacts();
                if let Some(conn) = conn {
                    let discovery_uuid = self
                        .store
                        .discovery_uuid()
                        .unwrap_or_else(|_| crypto::random_token());
                    self.reply_to(
                        conn,
                        &WireMessage::Accepted {
                            address: self.pid.clone(),
                            discovery_uuid,
                        },
                    );
                    // finish_session follows up with our hello, which
                    // carries the key the requester is still missing.
                    self.finish_session(conn, &fingerprint, now);
                }
            }
            Command::RejectContact { fingerprint } => {
                let conn = self
                    .conns
                    .iter()
                    .find(|(_, c)| c.fingerprint.as_deref() == Some(fingerprint.as_str()))
                    .map(|(id, _)| *id);
                if let Some(conn) = conn {
                    self.reply_to(conn, &WireMessage::Rejected);
                }
                self.ir.remove_contact(&fingerprint);
                self.persist_contacts();
            }
            Command::EditMessage {
                fingerprint,
                id,
                text,
                reply,
            } => {
                let result = self.ir.send_edit(&self.identity, &fingerprint, &id, text);
                if result.is_ok() {
                    self.persist_chat(&fingerprint);
                }
                let _ = reply.send(result);
            }
            Command::DeleteMessage {
                fingerprint,
                id,
                reply,
            } => {
                let result = self.ir.send_delete(&fingerprint, &id);
                match &result {
                    Ok(Some(tid)) => {
                        let _ = self.store.raw().delete_blob(tid);
                    }
                    Ok(None) => {}
                    Err(_) => {}
                }
                if result.is_ok() {
                    self.persist_chat(&fingerprint);
                }
                let _ = reply.send(result.map(|_| ()));
            }
            Command::SendFile {
                fingerprint,
                name,
                bytes,
                reply,
            } => {
                let result = self.send_direct_file(&fingerprint, &name, &bytes, now);
                let _ = reply.send(result);
            }
            Command::CallContact { fingerprint, kind } => {
                if let Some(conn) = self.ir.connection(&fingerprint) {
                    send_frame(&conn, &WireMessage::CallNotify { kind });
                }
            }
            Command::MarkRead { fingerprint, ts } => {
                let mut map = self.store.last_read().unwrap_or_default();
                map.insert(fingerprint, ts);
                let _ = self.store.save_last_read(&map);
            }
            Command::GroupMarkRead { group_id, ts } => {
                let mut map = self.store.group_last_read().unwrap_or_default();
                map.insert(group_id, ts);
                let _ = self.store.save_group_last_read(&map);
            }
            Command::SetName { name } => {
                self.config.friendly_name = name.clone();
                let frame = WireMessage::NameUpdate { name };
                for conn in self.conns.values() {
                    if conn.fingerprint.is_some() {
                        send_frame(&conn.sender, &frame);
                    }
                }
            }
            Command::JoinRoom { name } => {
                let slug = slugify(&name);
                if slug.is_empty() {
                    return false;
                }
                let config = custom_config(&self.config.prefix, &slug);
                if !self.namespaces.contains_key(&config.label) {
                    let handle = self.spawn_namespace(config);
                    self.namespaces.insert(handle.label().to_string(), handle);
                }
                let mut saved = self.store.custom_namespaces().unwrap_or_default();
                if !saved.iter().any(|r| r.slug == slug) {
                    saved.push(CustomNamespaceRecord {
                        name,
                        slug,
                        advanced: false,
                        offline: false,
                    });
                    let _ = self.store.save_custom_namespaces(&saved);
                }
            }
            Command::LeaveRoom { slug } => {
                let label = format!("custom:{slug}");
                if let Some(handle) = self.namespaces.remove(&label) {
                    handle.shutdown();
                }
                let mut saved = self.store.custom_namespaces().unwrap_or_default();
                saved.retain(|r| r.slug != slug);
                let _ = self.store.save_custom_namespaces(&saved);
            }
            Command::SetPosition { lat, lon } => {
                let Some(hasher) = self.config.geohasher.clone() else {
                    return false;
                };
                let cells = covering_cells(hasher.as_ref(), lat, lon);
                // Tear down cells we left, keep the ones still covered.
                let stale: Vec<String> = self
                    .namespaces
                    .keys()
                    .filter(|label| {
                        label
                            .strip_prefix("geo:")
                            .map(|cell| !cells.iter().any(|c| c == cell))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                for label in stale {
                    if let Some(handle) = self.namespaces.remove(&label) {
                        handle.shutdown();
                    }
                }
                for cell in &cells {
                    let config = geo_config(&self.config.prefix, cell);
                    if !self.namespaces.contains_key(&config.label) {
                        let handle = self.spawn_namespace(config);
                        self.namespaces.insert(handle.label().to_string(), handle);
                    }
                }
                self.bus.geo(GeoEvent::Enrolled { cells });
            }
            Command::CreateGroup { name, reply } => {
                let group = GroupState::create(
                    name,
                    &self.identity,
                    &self.config.friendly_name,
                    Some(self.pid.clone()),
                    self.bus.clone(),
                    now,
                );
                let group_id = group.info.group_id.clone();
                let ns = self.spawn_namespace(group_config(&self.config.prefix, &group_id));
                let mut group = group;
                group.attach(ns);
                self.groups.insert(group_id.clone(), group);
                self.persist_groups();
                let _ = reply.send(Ok(group_id));
            }
            Command::GroupInvite {
                group_id,
                fingerprint,
                reply,
            } => {
                let result = self.invite_to_group(&group_id, &fingerprint);
                let _ = reply.send(result);
            }
            Command::GroupSend {
                group_id,
                text,
                reply,
            } => {
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => group.send_text(&self.identity, &text, now),
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                if result.is_ok() {
                    self.persist_group(&group_id);
                }
                let _ = reply.send(result);
            }
            Command::GroupKick {
                group_id,
                fingerprint,
                reply,
            } => {
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => group.kick(&self.identity, &fingerprint),
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                if result.is_ok() {
                    self.persist_group(&group_id);
                }
                let _ = reply.send(result);
            }
            Command::GroupEditMessage {
                group_id,
                id,
                text,
                reply,
            } => {
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => group.edit_text(&self.identity, &id, &text),
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                if result.is_ok() {
                    self.persist_group(&group_id);
                }
                let _ = reply.send(result);
            }
            Command::GroupDeleteMessage {
                group_id,
                id,
                reply,
            } => {
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => group.delete_message(&id, None),
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                if result.is_ok() {
                    self.persist_group(&group_id);
                }
                let _ = reply.send(result);
            }
            Command::GroupSendFile {
                group_id,
                name,
                bytes,
                reply,
            } => {
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => {
                        let tid = group.send_file(&name, &bytes);
                        let meta = BlobMeta {
                            name,
                            size: bytes.len() as u64,
                            received_at: now,
                        };
                        if let Err(e) = self.store.raw().put_blob(&tid, &meta, &bytes) {
                            warn!(tid = %tid, "blob store failed: {e}");
                        }
                        Ok(tid)
                    }
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                let _ = reply.send(result);
            }
            Command::GroupCallStart {
                group_id,
                kind,
                reply,
            } => {
                let pid = self.pid.clone();
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => group.call_start(kind, &pid, now),
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                let _ = reply.send(result);
            }
            Command::GroupCallJoin { group_id, reply } => {
                let pid = self.pid.clone();
                let result = match self.groups.get_mut(&group_id) {
                    Some(group) => group.call_join(&pid, now),
                    None => Err(Error::NotFound(format!("group {group_id}"))),
                };
                let _ = reply.send(result);
            }
            Command::GroupCallLeave { group_id } => {
                if let Some(group) = self.groups.get_mut(&group_id) {
                    group.call_leave(now);
                }
            }
            Command::GroupLeave { group_id } => {
                if let Some(group) = self.groups.get_mut(&group_id) {
                    // Leaving the group also ends our call participation.
                    group.call_leave(now);
                    group.leave(&self.identity);
                }
                self.drop_group(&group_id);
            }
            Command::Contacts { reply } => {
                let _ = reply.send(self.ir.contacts().values().cloned().collect());
            }
            Command::SetOffline { offline } => {
                let _ = self.store.save_offline(offline);
                if offline {
                    for (_, handle) in self.namespaces.drain() {
                        handle.shutdown();
                    }
                    self.rvz.teardown_all();
                } else {
                    let _ = self.start_discovery_namespaces();
                }
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn send_direct_file(
        &mut self,
        fingerprint: &str,
        name: &str,
        bytes: &[u8],
        now: i64,
    ) -> Result<String> {
        let conn = self
            .ir
            .connection(fingerprint)
            .ok_or_else(|| Error::ContactUnreachable(fingerprint.to_string()))?;
        let tid = crypto::random_token();
        let chunks = crate::group::chunk_bytes(bytes);

        send_frame(
            &conn,
            &WireMessage::FileStart {
                tid: tid.clone(),
                name: name.to_string(),
                size: bytes.len() as u64,
                total: chunks.len() as u32,
            },
        );
        for (index, chunk) in chunks.iter().enumerate() {
            send_frame(
                &conn,
                &WireMessage::FileChunk {
                    tid: tid.clone(),
                    index: index as u32,
                    bytes: BASE64.encode(chunk),
                },
            );
        }
        send_frame(&conn, &WireMessage::FileEnd { tid: tid.clone() });

        let meta = BlobMeta {
            name: name.to_string(),
            size: bytes.len() as u64,
            received_at: now,
        };
        if let Err(e) = self.store.raw().put_blob(&tid, &meta, bytes) {
            warn!(tid = %tid, "blob store failed: {e}");
        }
        self.ir
            .record_outgoing_file(fingerprint, &tid, name, bytes.len() as u64, now);
        self.persist_chat(fingerprint);
        Ok(tid)
    }

    fn invite_to_group(&mut self, group_id: &str, fingerprint: &str) -> Result<()> {
        let invitee_pk = self
            .ir
            .contact(fingerprint)
            .and_then(|c| c.public_key.clone())
            .ok_or_else(|| Error::NotFound(format!("contact {fingerprint}")))?;
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
        let invite = group.build_invite(&self.identity, &invitee_pk)?;

        // Invites travel over the direct channel.
        let conn = self
            .conns
            .iter()
            .find(|(_, c)| c.fingerprint.as_deref() == Some(fingerprint))
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::ContactUnreachable(fingerprint.to_string()))?;
        self.reply_to(conn, &invite);
        Ok(())
    }

    fn after_group_activity(&mut self, group_id: &str, completed: Option<crate::group::CompletedFile>) {
        if let Some(file) = completed {
            if let Err(e) = self.store.raw().put_blob(&file.tid, &file.meta, &file.bytes) {
                warn!(tid = %file.tid, "blob store failed: {e}");
            }
        }
        self.persist_group(group_id);
    }

    fn drop_group(&mut self, group_id: &str) {
        if let Some(group) = self.groups.remove(group_id) {
            if let Some(ns) = group.namespace() {
                ns.shutdown();
            }
        }
        let _ = self.store.delete_group_messages(group_id);
        self.persist_groups();
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist_contacts(&self) {
        if let Err(e) = self.store.save_contacts(self.ir.contacts()) {
            warn!("contact persistence failed: {e}");
        }
    }

    fn persist_chat(&self, fingerprint: &str) {
        if let Err(e) = self.store.save_chat(fingerprint, self.ir.chat(fingerprint)) {
            warn!(contact = %fingerprint, "chat persistence failed: {e}");
        }
    }

    fn persist_group(&self, group_id: &str) {
        if let Some(group) = self.groups.get(group_id) {
            if let Err(e) = self.store.save_group_messages(group_id, group.log()) {
                warn!(group = %group_id, "group log persistence failed: {e}");
            }
        }
        self.persist_groups();
    }

    fn persist_groups(&self) {
        let infos: Vec<_> = self.groups.values().map(|g| g.persistable_info()).collect();
        if let Err(e) = self.store.save_groups(&infos) {
            warn!("group persistence failed: {e}");
        }
    }
}

fn send_frame(sender: &ChannelSender, msg: &WireMessage) {
    if let Ok(bytes) = msg.encode() {
        let _ = sender.send(bytes);
    }
}

async fn accept_opt(endpoint: &mut Option<Endpoint>) -> Option<Channel> {
    match endpoint {
        Some(ep) => ep.accept().await,
        None => std::future::pending().await,
    }
}
