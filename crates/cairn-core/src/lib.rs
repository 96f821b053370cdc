//! Cairn content-addressable storage.
//!
//! Keys are hashed into deterministic, sharded paths below a store root.
//! See [`path`] for the derivation and [`store`] for byte-stream access.

pub mod error;
pub mod path;
pub mod store;

pub use error::StoreError;
pub use path::{cas_path_transform, identity_path_transform, PathKey, PathTransform};
pub use store::{Store, StoreConfig};
