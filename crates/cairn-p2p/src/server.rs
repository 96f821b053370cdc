//! Replicating file server: owns the local store, the peer registry and the
//! transport, and runs the single dispatch loop that interprets frames from
//! every peer.
//!
//! Store: write locally, then send `StoreFile` + stream to every peer.
//! Get: answer locally if possible, otherwise ask every peer with a fresh
//! request id and wait (bounded) for the first `FileFound` or for every
//! peer to answer `FileNotFound`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use cairn_core::{cas_path_transform, PathTransform, Store, StoreConfig};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ServerError, TransportError};
use crate::peer::TcpPeer;
use crate::policy::{Decoder, FrameDecoder, Handshake, NopHandshake};
use crate::registry::PeerRegistry;
use crate::transport::{TcpTransport, TcpTransportConfig};
use crate::wire::{self, FileFound, FileNotFound, Frame, GetFile, Message, Rpc, StoreFile};

/// Default bound on a network lookup.
pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the buffer reserved up front for a fetched body.
const MAX_PREALLOC: u64 = 1024 * 1024;

/// Configuration for a [`FileServer`].
#[derive(Debug, Clone)]
pub struct FileServerConfig {
    pub listen_addr: String,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Peers dialed once at start. Failures are logged, not retried.
    pub bootstrap_nodes: Vec<String>,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    /// How long [`FileServer::get`] waits for peers to answer.
    pub get_timeout: Duration,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".into(),
            storage_root: PathBuf::from(cairn_core::store::DEFAULT_ROOT),
            path_transform: cas_path_transform,
            bootstrap_nodes: Vec::new(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(FrameDecoder),
            get_timeout: DEFAULT_GET_TIMEOUT,
        }
    }
}

/// Reply to an outstanding [`GetFile`], routed by request id.
#[derive(Debug)]
enum GetReply {
    Found(Vec<u8>),
    NotFound,
}

/// What the next stream frame from a given peer carries.
#[derive(Debug)]
enum PendingStream {
    Replicate { key: String, size: u64 },
    Fetch { request_id: u64, key: String, size: u64 },
}

/// A [`PendingStream`] tied to the connection that announced it, so a later
/// connection from the same address never inherits it.
#[derive(Debug)]
struct Announced {
    peer: Weak<TcpPeer>,
    stream: PendingStream,
}

type PendingStreams = HashMap<SocketAddr, Announced>;

/// A node in the replicated file store.
pub struct FileServer {
    store: Arc<Store>,
    registry: Arc<PeerRegistry>,
    transport: TcpTransport,
    bootstrap_nodes: Vec<String>,
    get_timeout: Duration,
    next_request_id: AtomicU64,
    waiters: Mutex<HashMap<u64, mpsc::UnboundedSender<GetReply>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl FileServer {
    pub fn new(config: FileServerConfig) -> Arc<Self> {
        let store = Arc::new(Store::new(StoreConfig {
            root: config.storage_root,
            path_transform: config.path_transform,
        }));
        let registry = Arc::new(PeerRegistry::new());
        let transport = TcpTransport::new(
            TcpTransportConfig {
                listen_addr: config.listen_addr,
                handshake: config.handshake,
                decoder: config.decoder,
            },
            registry.clone(),
        );

        Arc::new(Self {
            store,
            registry,
            transport,
            bootstrap_nodes: config.bootstrap_nodes,
            get_timeout: config.get_timeout,
            next_request_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Listen, dial the bootstrap nodes and run the dispatch loop until
    /// [`stop`](Self::stop) is called.
    ///
    /// A panic inside the dispatch loop stops the node and is returned as
    /// [`ServerError::DispatchFailed`]. The transport is closed on every exit
    /// path.
    pub async fn start(self: Arc<Self>) -> Result<(), ServerError> {
        let rpcs = self.transport.consume().ok_or(ServerError::AlreadyStarted)?;
        let addr = match self.transport.listen_and_accept().await {
            Ok(addr) => addr,
            Err(e) => {
                self.transport.close().await;
                return Err(e.into());
            }
        };
        info!(%addr, root = %self.store.root().display(), "file server started");

        self.bootstrap();

        let server = Arc::clone(&self);
        let dispatch = tokio::spawn(async move { server.run_loop(rpcs).await });
        let outcome = match dispatch.await {
            Ok(()) => {
                info!(%addr, "dispatch loop stopped");
                Ok(())
            }
            Err(e) => {
                error!(%addr, "dispatch loop failed, stopping node: {e}");
                Err(ServerError::DispatchFailed(e.to_string()))
            }
        };

        self.shutdown.cancel();
        self.transport.close().await;
        self.tasks.close();
        self.tasks.wait().await;
        outcome
    }

    /// Signal the node to shut down.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Address the transport is bound to, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.registry.addrs()
    }

    /// The local content store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn has(&self, key: &str) -> bool {
        self.store.has(key).await
    }

    /// Remove `key` from this node only.
    pub async fn delete(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.store.delete(key).await?)
    }

    /// Store `reader`'s content under `key` locally and replicate it to
    /// every connected peer. Replication failures are logged per peer and
    /// do not fail the call.
    pub async fn store_file<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let size = self.store.write(key, &mut buf.as_slice()).await?;

        let msg = Message::StoreFile(StoreFile {
            key: key.to_string(),
            size,
        });
        let mut replicated = 0usize;
        for peer in self.registry.snapshot() {
            match peer.send_with_stream(&msg, &mut buf.as_slice(), size).await {
                Ok(_) => replicated += 1,
                Err(e) => warn!(peer = %peer.remote_addr(), key, "replication failed: {e}"),
            }
        }

        info!(key, size, peers = replicated, "stored file");
        Ok(size)
    }

    /// Fetch `key`, locally if present, otherwise from the network. Content
    /// fetched from a peer is also written to the local store.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ServerError> {
        if self.store.has(key).await {
            debug!(key, "serving from local disk");
            return Ok(self.store.read(key).await?);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.lock_waiters().insert(request_id, tx);

        let msg = Message::GetFile(GetFile {
            request_id,
            key: key.to_string(),
        });
        let asked = self.broadcast(&msg).await;
        info!(key, request_id, peers = asked, "key not local, asking peers");

        let outcome = if asked == 0 {
            Ok(None)
        } else {
            tokio::time::timeout(self.get_timeout, await_reply(&mut rx, asked)).await
        };
        self.lock_waiters().remove(&request_id);

        match outcome {
            Ok(Some(data)) => {
                self.store.write(key, &mut data.as_slice()).await?;
                info!(key, bytes = data.len(), "fetched from network");
                Ok(data)
            }
            Ok(None) => Err(ServerError::NotFound {
                key: key.to_string(),
            }),
            Err(_) => Err(ServerError::Timeout {
                key: key.to_string(),
                timeout: self.get_timeout,
            }),
        }
    }

    /// Send `msg` to every peer; returns how many sends succeeded.
    async fn broadcast(&self, msg: &Message) -> usize {
        let mut sent = 0;
        for peer in self.registry.snapshot() {
            match peer.send_msg(msg).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer.remote_addr(), "broadcast failed: {e}"),
            }
        }
        sent
    }

    fn bootstrap(self: &Arc<Self>) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let server = Arc::clone(self);
            let addr = addr.clone();
            self.tasks.spawn(async move {
                debug!(%addr, "dialing bootstrap node");
                tokio::select! {
                    _ = server.shutdown.cancelled() => {}
                    result = server.transport.dial(&addr) => {
                        if let Err(e) = result {
                            warn!(%addr, "bootstrap dial failed: {e}");
                        }
                    }
                }
            });
        }
    }

    async fn run_loop(&self, mut rpcs: mpsc::UnboundedReceiver<Rpc>) {
        // Per-peer announcement awaiting its stream frame.
        let mut pending = PendingStreams::new();

        loop {
            let rpc = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                rpc = rpcs.recv() => match rpc {
                    Some(rpc) => rpc,
                    None => break,
                },
            };

            let from = rpc.from;
            // A peer stalling mid-body must not hold up shutdown.
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.handle_rpc(rpc, &mut pending) => result,
            };
            if let Err(e) = result {
                warn!(peer = %from, "failed to handle frame: {e}");
            }
        }
    }

    async fn handle_rpc(&self, rpc: Rpc, pending: &mut PendingStreams) -> Result<(), ServerError> {
        prune_pending(pending);
        match rpc.frame {
            Frame::Message(bytes) => {
                let msg = wire::decode_msg(&bytes)?;
                self.handle_message(rpc.from, msg, pending)
            }
            Frame::Stream(len) => {
                // The decode loop only pushes stream frames for live,
                // registered peers; it is parked on the gate until we reopen.
                let peer = self
                    .registry
                    .get(&rpc.from)
                    .ok_or(ServerError::UnknownPeer(rpc.from))?;
                let announced = pending
                    .remove(&rpc.from)
                    .filter(|a| a.peer.upgrade().is_some_and(|p| Arc::ptr_eq(&p, &peer)))
                    .map(|a| a.stream);
                let result = self.consume_stream(&peer, len, announced).await;
                peer.gate().open();
                result
            }
        }
    }

    fn handle_message(
        &self,
        from: SocketAddr,
        msg: Message,
        pending: &mut PendingStreams,
    ) -> Result<(), ServerError> {
        match msg {
            Message::StoreFile(StoreFile { key, size }) => {
                let peer = self
                    .registry
                    .get(&from)
                    .ok_or(ServerError::UnknownPeer(from))?;
                debug!(peer = %from, key = %key, size, "replication announced");
                announce(pending, &peer, PendingStream::Replicate { key, size });
            }
            Message::GetFile(GetFile { request_id, key }) => {
                let peer = self
                    .registry
                    .get(&from)
                    .ok_or(ServerError::UnknownPeer(from))?;
                debug!(peer = %from, key = %key, request_id, "peer requested key");
                self.spawn_serve_get(peer, request_id, key);
            }
            Message::FileFound(FileFound {
                request_id,
                key,
                size,
            }) => {
                let peer = self
                    .registry
                    .get(&from)
                    .ok_or(ServerError::UnknownPeer(from))?;
                debug!(peer = %from, key = %key, request_id, size, "peer has key");
                let stream = PendingStream::Fetch {
                    request_id,
                    key,
                    size,
                };
                announce(pending, &peer, stream);
            }
            Message::FileNotFound(FileNotFound { request_id, key }) => {
                debug!(peer = %from, key = %key, request_id, "peer lacks key");
                self.complete_get(request_id, GetReply::NotFound);
            }
        }
        Ok(())
    }

    /// Read exactly `len` body bytes from `peer` and route them according
    /// to the preceding announcement. The body is always fully consumed so
    /// the connection stays framed.
    async fn consume_stream(
        &self,
        peer: &TcpPeer,
        len: u64,
        announced: Option<PendingStream>,
    ) -> Result<(), ServerError> {
        let from = peer.remote_addr();
        let mut reader = peer.reader().await;
        let mut body = (&mut *reader).take(len);

        match announced {
            Some(PendingStream::Replicate { key, size }) => {
                if size != len {
                    warn!(
                        peer = %from,
                        key = %key,
                        announced = size,
                        actual = len,
                        "size mismatch"
                    );
                }
                // A short body keeps whatever copy we already had.
                let written = self.store.write_exact(&key, &mut body, len).await;
                tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
                let written = written?;
                info!(peer = %from, key = %key, bytes = written, "replicated file from peer");
            }
            Some(PendingStream::Fetch {
                request_id,
                key,
                size,
            }) => {
                if size != len {
                    warn!(
                        peer = %from,
                        key = %key,
                        announced = size,
                        actual = len,
                        "size mismatch"
                    );
                }
                let mut data = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
                body.read_to_end(&mut data).await?;
                if (data.len() as u64) < len {
                    return Err(TransportError::ConnectionClosed.into());
                }
                debug!(
                    peer = %from,
                    key = %key,
                    request_id,
                    bytes = data.len(),
                    "received requested key"
                );
                self.complete_get(request_id, GetReply::Found(data));
            }
            None => {
                let discarded = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
                warn!(peer = %from, bytes = discarded, "discarded unannounced stream");
            }
        }
        Ok(())
    }

    fn spawn_serve_get(&self, peer: Arc<TcpPeer>, request_id: u64, key: String) {
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = serve_get(&store, &peer, request_id, &key) => {
                    if let Err(e) = result {
                        let peer = peer.remote_addr();
                        warn!(%peer, key = %key, "failed to answer lookup: {e}");
                    }
                }
            }
        });
    }

    fn complete_get(&self, request_id: u64, reply: GetReply) {
        match self.lock_waiters().get(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(request_id, "reply for finished lookup dropped"),
        }
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<GetReply>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn announce(pending: &mut PendingStreams, peer: &Arc<TcpPeer>, stream: PendingStream) {
    let announced = Announced {
        peer: Arc::downgrade(peer),
        stream,
    };
    if let Some(stale) = pending.insert(peer.remote_addr(), announced) {
        let peer = peer.remote_addr();
        warn!(%peer, "announcement replaced before its stream: {:?}", stale.stream);
    }
}

/// Forget announcements from connections that have gone away.
fn prune_pending(pending: &mut PendingStreams) {
    pending.retain(|addr, announced| {
        let live = announced.peer.strong_count() > 0;
        if !live {
            debug!(peer = %addr, "dropping announcement from closed connection");
        }
        live
    });
}

/// First `Found` wins; `None` once all `asked` peers said `NotFound`.
async fn await_reply(
    rx: &mut mpsc::UnboundedReceiver<GetReply>,
    asked: usize,
) -> Option<Vec<u8>> {
    let mut misses = 0;
    while let Some(reply) = rx.recv().await {
        match reply {
            GetReply::Found(data) => return Some(data),
            GetReply::NotFound => {
                misses += 1;
                if misses >= asked {
                    return None;
                }
            }
        }
    }
    None
}

async fn serve_get(
    store: &Store,
    peer: &TcpPeer,
    request_id: u64,
    key: &str,
) -> Result<(), ServerError> {
    let not_found = Message::FileNotFound(FileNotFound {
        request_id,
        key: key.to_string(),
    });

    match store.open(key).await {
        Ok((size, mut file)) => {
            let msg = Message::FileFound(FileFound {
                request_id,
                key: key.to_string(),
                size,
            });
            peer.send_with_stream(&msg, &mut file, size).await?;
            debug!(peer = %peer.remote_addr(), key, size, "served key");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            peer.send_msg(&not_found).await?;
            Ok(())
        }
        Err(e) => {
            peer.send_msg(&not_found).await?;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerHandler;
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};

    async fn accepted_peer(listener: &TcpListener) -> Arc<TcpPeer> {
        let addr = listener.local_addr().unwrap();
        let (_dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Arc::new(TcpPeer::new(accepted.unwrap().0, false).unwrap())
    }

    fn config(tmp: &TempDir, name: &str) -> FileServerConfig {
        FileServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            storage_root: tmp.path().join(name),
            get_timeout: Duration::from_millis(500),
            ..FileServerConfig::default()
        }
    }

    #[tokio::test]
    async fn store_and_get_without_peers() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(config(&tmp, "solo"));

        let n = server
            .store_file("My Data", &mut &b"Gugu Gaga Iglabo ulala"[..])
            .await
            .unwrap();
        assert_eq!(n, 22);
        assert!(server.has("My Data").await);
        assert_eq!(server.get("My Data").await.unwrap(), b"Gugu Gaga Iglabo ulala");
    }

    #[tokio::test]
    async fn get_missing_without_peers_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(config(&tmp, "solo"));

        let err = server.get("absent").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
        assert!(server.lock_waiters().is_empty());
    }

    #[tokio::test]
    async fn delete_is_local_and_idempotent() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(config(&tmp, "solo"));

        server.store_file("k", &mut &b"v"[..]).await.unwrap();
        server.delete("k").await.unwrap();
        server.delete("k").await.unwrap();
        assert!(!server.has("k").await);
    }

    #[tokio::test]
    async fn await_reply_counts_misses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(GetReply::NotFound).unwrap();
        tx.send(GetReply::NotFound).unwrap();
        assert_eq!(await_reply(&mut rx, 2).await, None);

        tx.send(GetReply::NotFound).unwrap();
        tx.send(GetReply::Found(b"x".to_vec())).unwrap();
        assert_eq!(await_reply(&mut rx, 2).await, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(config(&tmp, "solo"));

        let running = tokio::spawn(server.clone().start());
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.listen_addr().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            server.clone().start().await,
            Err(ServerError::AlreadyStarted)
        ));

        server.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("server stops")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn store_file_from_unknown_peer_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(config(&tmp, "solo"));
        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut pending = PendingStreams::new();

        let msg = Message::StoreFile(StoreFile {
            key: "k".into(),
            size: 3,
        });
        let err = server
            .handle_message(stranger, msg, &mut pending)
            .unwrap_err();
        assert!(matches!(err, ServerError::UnknownPeer(a) if a == stranger));
        assert!(pending.is_empty());
        assert_eq!(server.peer_count(), 0);
        assert!(!server.has("k").await);
    }

    #[tokio::test]
    async fn announcement_is_recorded_for_registered_peer() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(config(&tmp, "solo"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = accepted_peer(&listener).await;
        server.registry.on_peer(peer.clone()).unwrap();
        let mut pending = PendingStreams::new();

        let msg = Message::StoreFile(StoreFile {
            key: "k".into(),
            size: 3,
        });
        server
            .handle_message(peer.remote_addr(), msg, &mut pending)
            .unwrap();

        let announced = pending.get(&peer.remote_addr()).expect("announcement kept");
        assert!(matches!(
            &announced.stream,
            PendingStream::Replicate { key, size: 3 } if key == "k"
        ));
    }

    #[tokio::test]
    async fn announcements_from_closed_connections_are_pruned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gone = accepted_peer(&listener).await;
        let live = accepted_peer(&listener).await;
        let mut pending = PendingStreams::new();

        for peer in [&gone, &live] {
            let stream = PendingStream::Replicate {
                key: "k".into(),
                size: 1,
            };
            announce(&mut pending, peer, stream);
        }
        let gone_addr = gone.remote_addr();
        drop(gone);

        prune_pending(&mut pending);
        assert!(!pending.contains_key(&gone_addr));
        assert!(pending.contains_key(&live.remote_addr()));
    }
}
