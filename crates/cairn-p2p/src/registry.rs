//! Live table of connected peers, keyed by remote address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::TransportError;
use crate::peer::TcpPeer;

/// Registration capability handed to the transport at construction time.
///
/// `on_peer` runs once per connection right after a successful handshake;
/// an error closes the connection. `on_disconnect` runs when the
/// connection's task ends for any reason.
pub trait PeerHandler: Send + Sync + 'static {
    fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), TransportError>;

    fn on_disconnect(&self, peer: &Arc<TcpPeer>);
}

/// Connected peers. Every access goes through one lock.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<SocketAddr, Arc<TcpPeer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<TcpPeer>> {
        self.lock().get(addr).cloned()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.lock().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.lock().keys().copied().collect()
    }

    /// Peers connected right now, for broadcasting. Sends happen after the
    /// lock is released; each peer serialises its own writes.
    pub fn snapshot(&self) -> Vec<Arc<TcpPeer>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, Arc<TcpPeer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerHandler for PeerRegistry {
    fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), TransportError> {
        let addr = peer.remote_addr();
        let mut peers = self.lock();
        if peers.contains_key(&addr) {
            return Err(TransportError::DuplicatePeer(addr));
        }
        peers.insert(addr, peer);
        info!(peer = %addr, total = peers.len(), "peer registered");
        Ok(())
    }

    fn on_disconnect(&self, peer: &Arc<TcpPeer>) {
        let addr = peer.remote_addr();
        let mut peers = self.lock();
        // Only drop the entry if it is this connection, not a newer one.
        if peers.get(&addr).is_some_and(|p| Arc::ptr_eq(p, peer)) {
            peers.remove(&addr);
            debug!(peer = %addr, total = peers.len(), "peer removed");
        }
    }
}
