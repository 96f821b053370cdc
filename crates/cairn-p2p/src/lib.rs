//! Cairn peer-to-peer replication layer.
//!
//! A [`transport::TcpTransport`] accepts and dials TCP connections, runs a
//! pluggable handshake and frame decoder per connection, and hands decoded
//! frames to the node's [`server::FileServer`], which replicates writes to
//! every connected peer and answers remote lookups.

pub mod error;
pub mod peer;
pub mod policy;
pub mod registry;
pub mod server;
pub mod transport;
pub mod wire;

pub use error::{ServerError, TransportError};
pub use peer::{StreamGate, TcpPeer};
pub use policy::{Decoder, FrameDecoder, Handshake, MagicHandshake, NopHandshake};
pub use registry::{PeerHandler, PeerRegistry};
pub use server::{FileServer, FileServerConfig};
pub use transport::{TcpTransport, TcpTransportConfig};

/// Magic bytes exchanged by [`MagicHandshake`].
pub const HANDSHAKE_MAGIC: &[u8; 5] = b"CAIRN";

/// Wire protocol version announced during the handshake.
pub const PROTOCOL_VERSION: u8 = 1;
