//! Core data model for the skein gossip engine
//!
//! Leaf crate shared by every other member of the workspace:
//! - **types**: strong newtypes for protocol digests, membership records,
//!   logical peer timestamps
//! - **crypto**: SHA-256 identity digests and Ed25519 signatures
//! - **identity**: the node's keypair
//! - **config**: tuning knobs for gossip, discovery and the comm layer
//! - **filesystem**: the create/open/stat seam channels sync files through
//! - **error**: engine-wide error kinds

pub mod config;
pub mod crypto;
pub mod error;
pub mod filesystem;
pub mod identity;
pub mod types;

pub use config::{CommConfig, GossipConfig, IdentityConfig};
pub use crypto::CryptoError;
pub use error::GossipError;
pub use filesystem::{DiskFileSystem, FileSystem};
pub use identity::NodeIdentity;
pub use types::{ChainMac, FileMode, FileSyncInfo, NetworkMember, PeerIdentity, PeerTime, PkiId};
