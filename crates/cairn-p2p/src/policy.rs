//! Pluggable per-connection policies: handshakes and frame decoders.
//!
//! The transport calls these through trait objects so that alternative
//! authentication or framing can be swapped in without touching the
//! connection loop.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::TransportError;
use crate::peer::TcpPeer;
use crate::wire::{self, Frame};
use crate::{HANDSHAKE_MAGIC, PROTOCOL_VERSION};

/// Runs once on every new connection, inbound or outbound, before any
/// frame is decoded. An error closes the connection.
#[async_trait]
pub trait Handshake: Send + Sync + Debug + 'static {
    async fn handshake(&self, peer: &TcpPeer) -> Result<(), TransportError>;
}

/// Turns bytes on a connection into [`Frame`]s.
#[async_trait]
pub trait Decoder: Send + Sync + Debug + 'static {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Frame, TransportError>;
}

/// Accepts every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _peer: &TcpPeer) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Both sides send `CAIRN` plus a version byte and check the other's.
#[derive(Debug, Clone, Copy)]
pub struct MagicHandshake {
    pub version: u8,
}

impl Default for MagicHandshake {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }
}

#[async_trait]
impl Handshake for MagicHandshake {
    async fn handshake(&self, peer: &TcpPeer) -> Result<(), TransportError> {
        let mut hello = [0u8; 6];
        hello[..5].copy_from_slice(HANDSHAKE_MAGIC);
        hello[5] = self.version;
        peer.send(&hello).await?;

        let mut remote = [0u8; 6];
        peer.reader()
            .await
            .read_exact(&mut remote)
            .await
            .map_err(TransportError::from_read)?;

        if &remote[..5] != HANDSHAKE_MAGIC {
            return Err(TransportError::HandshakeRejected(format!(
                "bad magic {:02x?}",
                &remote[..5]
            )));
        }
        if remote[5] != self.version {
            return Err(TransportError::HandshakeRejected(format!(
                "unsupported protocol version: {} (expected {})",
                remote[5], self.version
            )));
        }

        debug!(peer = %peer.remote_addr(), version = self.version, "handshake complete");
        Ok(())
    }
}

/// Decodes the length-prefixed frames described in [`crate::wire`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameDecoder;

#[async_trait]
impl Decoder for FrameDecoder {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Frame, TransportError> {
        wire::read_frame(reader).await
    }
}
