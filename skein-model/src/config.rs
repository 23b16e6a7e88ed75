//! Configuration for the gossip engine
//!
//! Plain structs handed to the service at construction. Defaults are
//! production-shaped; tests shrink the intervals to keep wall-clock short.

use std::time::Duration;

/// Tuning for gossip dissemination, discovery and channel reconciliation.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Endpoint this node listens on and advertises in alive messages.
    pub endpoint: String,
    /// Endpoints dialed at startup to seed the membership view.
    pub bootstrap_peers: Vec<String>,
    /// How many bursts each gossiped message is replayed in. Zero disables
    /// push gossip entirely.
    pub propagate_iterations: usize,
    /// Buffered messages that force an early burst.
    pub max_propagation_burst_size: usize,
    /// Longest a buffered message waits before a burst is forced.
    pub max_propagation_burst_latency: Duration,
    /// Peers each message is pushed to per burst.
    pub propagate_peer_num: usize,
    /// Cadence of membership and channel pull rounds.
    pub pull_interval: Duration,
    /// Peers pulled from per round.
    pub pull_peer_num: usize,
    /// Warm-up window after startup during which alive messages embed the
    /// full identity, so fresh peers can learn it without a handshake.
    pub publish_cert_period: Duration,
    /// Cadence of the leader's channel-state republish.
    pub publish_state_info_interval: Duration,
    /// Cadence of alive heartbeats and of the aliveness sweep.
    pub alive_time_interval: Duration,
    /// Silence after which an alive peer is presumed dead.
    pub alive_expiration_timeout: Duration,
    /// Multiple of `alive_expiration_timeout` after which a dead peer is
    /// forgotten entirely.
    pub msg_expiration_factor: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bootstrap_peers: Vec::new(),
            propagate_iterations: 1,
            max_propagation_burst_size: 10,
            max_propagation_burst_latency: Duration::from_millis(10),
            propagate_peer_num: 3,
            pull_interval: Duration::from_secs(4),
            pull_peer_num: 3,
            publish_cert_period: Duration::from_secs(10),
            publish_state_info_interval: Duration::from_secs(4),
            alive_time_interval: Duration::from_secs(5),
            alive_expiration_timeout: Duration::from_secs(25),
            msg_expiration_factor: 20,
        }
    }
}

/// Identity-related configuration.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// Human-assigned node id, bound into the PKI-id derivation.
    pub node_id: String,
    /// How long an unused remote identity stays cached before the sweep
    /// purges it and closes its connection.
    pub identity_usage_ttl: Duration,
}

impl IdentityConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            identity_usage_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Tuning for the comm layer.
#[derive(Clone, Debug)]
pub struct CommConfig {
    /// Time allowed for the transport to establish a connection.
    pub dial_timeout: Duration,
    /// Time allowed for the ConnEstablish exchange and for probe replies.
    pub handshake_timeout: Duration,
    /// Depth of each peer's outbound queue. Overflow drops the message and
    /// presumes the peer dead.
    pub send_queue_depth: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(2),
            send_queue_depth: 100,
        }
    }
}
