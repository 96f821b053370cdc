use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use cairn_core::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unknown frame tag {0:#04x}")]
    UnknownFrame(u8),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(u64),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("peer {0} is already registered")]
    DuplicatePeer(SocketAddr),
    #[error("transport is already listening on {0}")]
    AlreadyListening(SocketAddr),
}

impl TransportError {
    /// Classify a read failure; a clean EOF means the remote hung up.
    pub(crate) fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::Read(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("message from unknown peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("key {key:?} not found on any peer")]
    NotFound { key: String },
    #[error("timed out after {timeout:?} waiting for key {key:?}")]
    Timeout { key: String, timeout: Duration },
    #[error("file server already started")]
    AlreadyStarted,
    #[error("dispatch loop failed: {0}")]
    DispatchFailed(String),
}

impl ServerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
