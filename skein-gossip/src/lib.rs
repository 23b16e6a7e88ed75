//! skein gossip engine
//!
//! Peer-to-peer membership and state propagation:
//! - **identity_map**: PKI-id → identity bindings, signing and verification
//! - **msg_store**: deduplicating, optionally expiring message set
//! - **emitter**: burst-batching outbound gossip
//! - **filter**: composable routing predicates and random peer selection
//! - **discovery**: alive heartbeats, peer liveness, membership anti-entropy
//! - **channel**: per-channel membership, file manifests, pull reconciliation
//! - **service**: the orchestrator wiring everything to the comm layer

pub mod channel;
pub mod discovery;
pub mod emitter;
pub mod filter;
pub mod identity_map;
pub mod msg_store;
pub mod service;

pub use channel::{ChannelAdapter, ChannelRegistry, GossipChannel};
pub use discovery::{
    Discovery, DiscoveryComm, DiscoverySecurity, DisclosurePolicy, EnvelopeFilter, Sieve,
};
pub use emitter::{BatchingEmitter, EmittedMessage};
pub use filter::{combine, select_all, select_peers, RoutingFilter};
pub use identity_map::IdentityMapper;
pub use msg_store::MessageStore;
pub use service::GossipService;
