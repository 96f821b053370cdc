//! TCP transport: listener, dialer and one decode task per connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::peer::TcpPeer;
use crate::policy::{Decoder, FrameDecoder, Handshake, NopHandshake};
use crate::registry::PeerHandler;
use crate::wire::{Frame, Rpc};

/// Back-off after a failed `accept` so a persistent error cannot spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for a [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address to bind, e.g. `127.0.0.1:3000`. Port 0 picks a free port.
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".into(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(FrameDecoder),
        }
    }
}

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
struct ConnContext {
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    handler: Arc<dyn PeerHandler>,
    rpc_tx: mpsc::UnboundedSender<Rpc>,
    shutdown: CancellationToken,
}

/// Accepts and dials TCP peers and funnels their frames into one queue.
pub struct TcpTransport {
    config: TcpTransportConfig,
    ctx: ConnContext,
    rpc_rx: Mutex<Option<mpsc::UnboundedReceiver<Rpc>>>,
    local_addr: OnceLock<SocketAddr>,
    tasks: TaskTracker,
}

impl TcpTransport {
    /// `handler` is told about every peer that passes the handshake.
    pub fn new(config: TcpTransportConfig, handler: Arc<dyn PeerHandler>) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let ctx = ConnContext {
            handshake: config.handshake.clone(),
            decoder: config.decoder.clone(),
            handler,
            rpc_tx,
            shutdown: CancellationToken::new(),
        };
        Self {
            config,
            ctx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            local_addr: OnceLock::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.config.listen_addr
    }

    /// Bound address, once [`listen_and_accept`](Self::listen_and_accept) succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind the listener and start accepting in the background.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        if let Some(addr) = self.local_addr() {
            return Err(TransportError::AlreadyListening(addr));
        }

        let bind_err = |source| TransportError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;
        if self.local_addr.set(addr).is_err() {
            return Err(TransportError::AlreadyListening(addr));
        }

        info!(%addr, "listening for peers");
        self.tasks.spawn(accept_loop(listener, self.ctx.clone(), self.tasks.clone()));
        Ok(addr)
    }

    /// Connect to `addr` and run the connection like an accepted one.
    pub async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        debug!(addr, "dialed peer");
        self.tasks.spawn(handle_conn(self.ctx.clone(), stream, true));
        Ok(())
    }

    /// Take the queue of inbound frames. Only the first caller gets it.
    pub fn consume(&self) -> Option<mpsc::UnboundedReceiver<Rpc>> {
        self.rpc_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stop accepting, cancel every connection task and wait for them.
    pub async fn close(&self) {
        self.ctx.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(addr = ?self.local_addr(), "transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }
}

async fn accept_loop(listener: TcpListener, ctx: ConnContext, tasks: TaskTracker) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted connection");
                    tasks.spawn(handle_conn(ctx.clone(), stream, false));
                }
                Err(e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

async fn handle_conn(ctx: ConnContext, stream: TcpStream, outbound: bool) {
    let peer = match TcpPeer::new(stream, outbound) {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            warn!("dropping connection without peer address: {e}");
            return;
        }
    };
    let addr = peer.remote_addr();

    let handshake = tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        result = ctx.handshake.handshake(&peer) => result,
    };
    if let Err(e) = handshake {
        warn!(peer = %addr, "handshake failed: {e}");
        peer.shutdown().await;
        return;
    }

    if let Err(e) = ctx.handler.on_peer(peer.clone()) {
        warn!(peer = %addr, "peer rejected: {e}");
        peer.shutdown().await;
        return;
    }
    info!(peer = %addr, outbound, "peer connected");

    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => None,
        result = read_loop(&ctx, &peer) => Some(result),
    };
    match outcome {
        None => debug!(peer = %addr, "connection task cancelled"),
        Some(Ok(())) => debug!(peer = %addr, "frame consumer gone, closing connection"),
        Some(Err(TransportError::ConnectionClosed)) => info!(peer = %addr, "peer disconnected"),
        Some(Err(e)) => warn!(peer = %addr, "dropping peer: {e}"),
    }

    ctx.handler.on_disconnect(&peer);
    peer.shutdown().await;
}

/// Decode frames until the connection fails or the consumer goes away.
///
/// After handing over a stream header the gate stays closed until the
/// dispatcher has read the body, so the next decode starts on a frame
/// boundary.
async fn read_loop(ctx: &ConnContext, peer: &TcpPeer) -> Result<(), TransportError> {
    let from = peer.remote_addr();
    loop {
        let frame = {
            let mut reader = peer.reader().await;
            ctx.decoder.decode(&mut *reader).await?
        };

        let is_stream = matches!(frame, Frame::Stream(_));
        if is_stream {
            peer.gate().close();
        }
        if ctx.rpc_tx.send(Rpc { from, frame }).is_err() {
            return Ok(());
        }
        if is_stream {
            peer.gate().wait_open().await;
        }
    }
}
