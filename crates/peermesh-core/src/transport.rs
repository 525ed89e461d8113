//! Narrow transport abstraction over the signaling/WebRTC layer.
//!
//! All namespace logic is transport-agnostic: it only ever creates named
//! endpoints, connects to named endpoints, and exchanges byte frames over
//! the resulting channels. A production backend wraps a real signaling
//! service; [`MemoryHub`] provides a process-local implementation with the
//! same failure modes (taken ids, unreachable ids, simulated outage) and
//! drives the whole integration test suite.
//!
//! Channels are split into a cloneable sender half and a receiving half.
//! Routers keep the sender half inside registry entries; a close is
//! observed as `recv() == None` and invalidates the handle, so nothing
//! owns a connection from both ends.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Cloneable sending half of a peer channel.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSender {
    /// Send one frame. Fails once the remote half is gone.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(bytes).map_err(|_| Error::ChannelClosed)
    }

    /// Whether the remote half has hung up.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a peer channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelReceiver {
    /// Receive the next frame; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A message-oriented bidirectional channel to one remote peer.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    /// Send one frame.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender.send(bytes)
    }

    /// Receive the next frame; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    /// Clone only the sending half.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }
}

/// Build a connected pair of channels (one per side).
pub fn channel_pair() -> (Channel, Channel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Channel {
            sender: ChannelSender { tx: a_tx },
            receiver: ChannelReceiver { rx: b_rx },
        },
        Channel {
            sender: ChannelSender { tx: b_tx },
            receiver: ChannelReceiver { rx: a_rx },
        },
    )
}

/// A named signaling endpoint owned by the local peer.
///
/// Dropping the endpoint releases the id.
pub struct Endpoint {
    id: String,
    incoming: mpsc::UnboundedReceiver<Channel>,
    _guard: Box<dyn Send>,
}

impl Endpoint {
    /// The endpoint id this peer claimed.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Accept the next inbound channel; `None` once the endpoint is gone.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).finish()
    }
}

/// Abstract signaling/transport backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Claim a named endpoint.
    ///
    /// Fails with [`Error::AddressTaken`] when another live peer holds the
    /// id, and with [`Error::NetworkDown`] when the signaling service is
    /// unreachable.
    async fn create_endpoint(&self, id: &str) -> Result<Endpoint>;

    /// Open a channel to a named endpoint.
    ///
    /// Fails with [`Error::AddressUnavailable`] when nobody holds the id.
    async fn connect(&self, id: &str) -> Result<Channel>;
}

/// Non-signaling reachability probe, used by the signaling gate to tell a
/// rate-limit ban apart from a dead network.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Whether the wider network currently answers at all.
    async fn reachable(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Registration {
    generation: u64,
    tx: mpsc::UnboundedSender<Channel>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<String, Registration>,
}

/// Process-local signaling hub.
///
/// Every peer in a test gets its own [`MemoryTransport`] handle from the
/// same hub; endpoint ids are claimed hub-wide, which reproduces the
/// id-taken semantics elections depend on.
pub struct MemoryHub {
    state: Mutex<HubState>,
    online: AtomicBool,
    generation: AtomicU64,
}

impl MemoryHub {
    /// Create a new hub, online.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            online: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        })
    }

    /// Simulate the signaling service going away or coming back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Produce a transport handle for one peer.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
        }
    }

    /// Whether an id is currently claimed (live) on the hub.
    pub fn is_claimed(&self, id: &str) -> bool {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        state
            .endpoints
            .get(id)
            .map(|r| !r.tx.is_closed())
            .unwrap_or(false)
    }

    fn release(&self, id: &str, generation: u64) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        if let Some(reg) = state.endpoints.get(id) {
            if reg.generation == generation {
                state.endpoints.remove(id);
            }
        }
    }
}

struct EndpointGuard {
    hub: Arc<MemoryHub>,
    id: String,
    generation: u64,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.hub.release(&self.id, self.generation);
    }
}

/// One peer's handle onto a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_endpoint(&self, id: &str) -> Result<Endpoint> {
        if !self.hub.online.load(Ordering::SeqCst) {
            return Err(Error::NetworkDown);
        }
        let generation = self.hub.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, incoming) = mpsc::unbounded_channel();
        {
            let mut state = match self.hub.state.lock() {
                Ok(s) => s,
                Err(p) => p.into_inner(),
            };
            if let Some(existing) = state.endpoints.get(id) {
                if !existing.tx.is_closed() {
                    return Err(Error::AddressTaken(id.to_string()));
                }
            }
            state.endpoints.insert(id.to_string(), Registration { generation, tx });
        }
        Ok(Endpoint {
            id: id.to_string(),
            incoming,
            _guard: Box::new(EndpointGuard {
                hub: Arc::clone(&self.hub),
                id: id.to_string(),
                generation,
            }),
        })
    }

    async fn connect(&self, id: &str) -> Result<Channel> {
        if !self.hub.online.load(Ordering::SeqCst) {
            return Err(Error::NetworkDown);
        }
        let tx = {
            let state = match self.hub.state.lock() {
                Ok(s) => s,
                Err(p) => p.into_inner(),
            };
            match state.endpoints.get(id) {
                Some(reg) if !reg.tx.is_closed() => reg.tx.clone(),
                _ => return Err(Error::AddressUnavailable(id.to_string())),
            }
        };
        let (local, remote) = channel_pair();
        tx.send(remote)
            .map_err(|_| Error::AddressUnavailable(id.to_string()))?;
        Ok(local)
    }
}

#[async_trait]
impl Reachability for MemoryHub {
    async fn reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_claim_and_conflict() {
        let hub = MemoryHub::new();
        let t1 = hub.transport();
        let t2 = hub.transport();

        let ep = t1.create_endpoint("ns-room-1").await.expect("claim");
        assert_eq!(ep.id(), "ns-room-1");

        match t2.create_endpoint("ns-room-1").await {
            Err(Error::AddressTaken(id)) => assert_eq!(id, "ns-room-1"),
            other => panic!("expected AddressTaken, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_id_released_on_drop() {
        let hub = MemoryHub::new();
        let t = hub.transport();

        let ep = t.create_endpoint("ns-x-1").await.expect("claim");
        assert!(hub.is_claimed("ns-x-1"));
        drop(ep);
        assert!(!hub.is_claimed("ns-x-1"));

        t.create_endpoint("ns-x-1").await.expect("reclaim");
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let hub = MemoryHub::new();
        let t1 = hub.transport();
        let t2 = hub.transport();

        let mut ep = t1.create_endpoint("peer-a").await.expect("claim");
        let client = t2.connect("peer-a").await.expect("connect");
        let server = ep.accept().await.expect("accept");

        client.send(b"ping".to_vec()).expect("send");
        let mut server = server;
        assert_eq!(server.recv().await.expect("frame"), b"ping");

        server.send(b"pong".to_vec()).expect("send");
        let mut client = client;
        assert_eq!(client.recv().await.expect("frame"), b"pong");
    }

    #[tokio::test]
    async fn test_connect_unknown_id() {
        let hub = MemoryHub::new();
        let t = hub.transport();
        match t.connect("nobody-here").await {
            Err(Error::AddressUnavailable(_)) => {}
            other => panic!("expected AddressUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_hub() {
        let hub = MemoryHub::new();
        let t = hub.transport();
        hub.set_online(false);

        assert!(matches!(
            t.create_endpoint("x").await,
            Err(Error::NetworkDown)
        ));
        assert!(matches!(t.connect("x").await, Err(Error::NetworkDown)));
        assert!(!hub.reachable().await);

        hub.set_online(true);
        t.create_endpoint("x").await.expect("claim after recovery");
    }

    #[tokio::test]
    async fn test_close_observed_by_peer() {
        let hub = MemoryHub::new();
        let t1 = hub.transport();
        let t2 = hub.transport();

        let mut ep = t1.create_endpoint("peer-b").await.expect("claim");
        let client = t2.connect("peer-b").await.expect("connect");
        let server = ep.accept().await.expect("accept");

        drop(client);
        let (_tx, mut rx) = server.split();
        assert!(rx.recv().await.is_none());
    }
}
