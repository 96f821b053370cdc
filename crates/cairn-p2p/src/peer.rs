//! A single TCP connection to a remote node.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::TransportError;
use crate::wire::{self, Message};

/// Binary gate between a peer's decode loop and the dispatcher.
///
/// Closed while the dispatcher reads a stream body directly off the
/// connection; the decode loop waits for it to reopen before decoding the
/// next frame. Starts open.
#[derive(Debug)]
pub struct StreamGate {
    state: watch::Sender<bool>,
}

impl StreamGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self { state }
    }

    pub fn close(&self) {
        self.state.send_replace(false);
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the gate is open.
    pub async fn wait_open(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected remote node.
///
/// The read half is shared between the transport's decode loop and the
/// dispatcher (for stream bodies); the [`StreamGate`] decides who reads.
/// All writes go through one lock so frames never interleave.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    /// We dialed this peer (as opposed to accepting it).
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    gate: StreamGate,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, outbound: bool) -> std::io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            remote_addr,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            gate: StreamGate::new(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn gate(&self) -> &StreamGate {
        &self.gate
    }

    /// Exclusive access to the read half, for bounded direct reads.
    pub async fn reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Write raw bytes to the connection.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(TransportError::Write)
    }

    /// Write one message frame.
    pub async fn send_msg(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = wire::encode_msg(msg)?;
        self.send(&frame).await
    }

    /// Write `msg` followed by a stream frame carrying exactly `len` bytes
    /// from `body`, without letting other senders interleave.
    ///
    /// If `body` runs dry early the connection can no longer be framed, so
    /// the write half is shut down and an error returned.
    pub async fn send_with_stream<R>(
        &self,
        msg: &Message,
        body: &mut R,
        len: u64,
    ) -> Result<u64, TransportError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let frame = wire::encode_msg(msg)?;
        let mut writer = self.writer.lock().await;

        writer
            .write_all(&frame)
            .await
            .map_err(TransportError::Write)?;
        wire::write_stream_header(&mut *writer, len).await?;

        let mut limited = body.take(len);
        let copied = tokio::io::copy(&mut limited, &mut *writer)
            .await
            .map_err(TransportError::Write)?;
        if copied != len {
            let _ = writer.shutdown().await;
            return Err(TransportError::Write(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream body ended after {copied} of {len} bytes"),
            )));
        }
        writer.flush().await.map_err(TransportError::Write)?;
        Ok(copied)
    }

    /// Shut down our side of the connection.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.remote_addr, "shutdown: {e}");
        }
    }
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("gate_open", &self.gate.is_open())
            .finish()
    }
}
