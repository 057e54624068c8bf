//! Packet transport seam and an in-process loopback network.
//!
//! The coordinator only needs to send a payload to a peer with a priority
//! and ordering channel, and to be told about inbound packets and peer
//! connectivity. Real transports implement [`Transport`] and feed
//! [`NetworkEvent`]s into [`TransferCoordinator::serve`](crate::TransferCoordinator::serve).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dirdelta_protocol::SendParams;
use dirdelta_transfer::TransferError;
use tokio::sync::mpsc;
use tracing::debug;

/// A boxed future returned by [`Transport::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + 'a>>;

/// Outbound half of a message transport.
///
/// Payloads sent to one peer on one ordering channel must arrive in send
/// order.
pub trait Transport: Send + Sync + 'static {
    /// Sends `payload` to `peer`.
    fn send(&self, peer: SocketAddr, params: SendParams, payload: Vec<u8>) -> SendFuture<'_>;

    /// Address peers use to reach this endpoint.
    fn local_addr(&self) -> SocketAddr;
}

/// Inbound event delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Packet {
        from: SocketAddr,
        params: SendParams,
        payload: Vec<u8>,
    },
    Connected(SocketAddr),
    Disconnected(SocketAddr),
}

// ---------------------------------------------------------------------------
// MemoryNetwork
// ---------------------------------------------------------------------------

/// Loopback network connecting endpoints inside one process.
///
/// Every endpoint has a single FIFO inbox, which preserves the order of
/// every channel. Priorities are ignored.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    inboxes: HashMap<SocketAddr, mpsc::UnboundedSender<NetworkEvent>>,
    links: HashSet<(SocketAddr, SocketAddr)>,
}

fn link(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b { (a, b) } else { (b, a) }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an endpoint at `addr`, returning its transport and inbox.
    ///
    /// Registering an address again replaces the previous inbox.
    pub fn endpoint(
        &self,
        addr: SocketAddr,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner().inboxes.insert(addr, tx);
        let transport = MemoryTransport {
            network: self.clone(),
            addr,
            packets_sent: Arc::new(AtomicU64::new(0)),
        };
        (transport, rx)
    }

    /// Links two endpoints; both receive [`NetworkEvent::Connected`].
    pub fn connect(&self, a: SocketAddr, b: SocketAddr) {
        let mut inner = self.inner();
        if inner.links.insert(link(a, b)) {
            notify(&inner, a, NetworkEvent::Connected(b));
            notify(&inner, b, NetworkEvent::Connected(a));
        }
    }

    /// Cuts the link; both sides receive [`NetworkEvent::Disconnected`].
    pub fn disconnect(&self, a: SocketAddr, b: SocketAddr) {
        let mut inner = self.inner();
        if inner.links.remove(&link(a, b)) {
            debug!(%a, %b, "loopback link cut");
            notify(&inner, a, NetworkEvent::Disconnected(b));
            notify(&inner, b, NetworkEvent::Disconnected(a));
        }
    }

    pub fn is_connected(&self, a: SocketAddr, b: SocketAddr) -> bool {
        self.inner().links.contains(&link(a, b))
    }

    fn deliver(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        event: NetworkEvent,
    ) -> Result<(), TransferError> {
        let inner = self.inner();
        if !inner.links.contains(&link(from, to)) {
            return Err(TransferError::PeerDisconnected(to));
        }
        let inbox = inner
            .inboxes
            .get(&to)
            .ok_or(TransferError::PeerDisconnected(to))?;
        inbox
            .send(event)
            .map_err(|_| TransferError::PeerDisconnected(to))
    }
}

fn notify(inner: &NetworkInner, addr: SocketAddr, event: NetworkEvent) {
    if let Some(inbox) = inner.inboxes.get(&addr) {
        let _ = inbox.send(event);
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
    packets_sent: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Number of payloads successfully handed to a peer.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, peer: SocketAddr, params: SendParams, payload: Vec<u8>) -> SendFuture<'_> {
        Box::pin(async move {
            let event = NetworkEvent::Packet {
                from: self.addr,
                params,
                payload,
            };
            self.network.deliver(self.addr, peer, event)?;
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}
