//! Shared helpers for gossip integration tests

use skein_gossip::GossipService;
use skein_model::{
    CommConfig, DiskFileSystem, GossipConfig, IdentityConfig, NodeIdentity, PkiId,
};
use skein_net_sim::{ChannelNetwork, ChannelTransport};
use std::sync::Arc;
use std::time::Duration;

/// A node under test, running over the in-memory network.
pub struct TestNode {
    pub service: Arc<GossipService<ChannelTransport>>,
    pub pki_id: PkiId,
    pub endpoint: String,
    _files: tempfile::TempDir,
}

/// Timings shrunk so convergence happens within a few hundred ms.
pub fn test_config(endpoint: &str, bootstrap: Vec<String>) -> GossipConfig {
    GossipConfig {
        endpoint: endpoint.to_string(),
        bootstrap_peers: bootstrap,
        propagate_iterations: 1,
        max_propagation_burst_size: 10,
        max_propagation_burst_latency: Duration::from_millis(10),
        propagate_peer_num: 3,
        pull_interval: Duration::from_millis(200),
        pull_peer_num: 3,
        publish_cert_period: Duration::from_secs(30),
        publish_state_info_interval: Duration::from_millis(200),
        alive_time_interval: Duration::from_millis(100),
        alive_expiration_timeout: Duration::from_millis(500),
        msg_expiration_factor: 2,
    }
}

pub async fn spawn_node(
    endpoint: &str,
    bootstrap: Vec<String>,
    network: &ChannelNetwork,
) -> TestNode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let files = tempfile::tempdir().expect("tempdir");
    let node = NodeIdentity::generate();
    let transport = Arc::new(ChannelTransport::new(endpoint, network).await);

    let service = GossipService::spawn(
        test_config(endpoint, bootstrap),
        IdentityConfig::new(endpoint),
        CommConfig::default(),
        node,
        transport,
        Arc::new(DiskFileSystem::new(files.path())),
    );
    let pki_id = service.self_pki_id();

    TestNode {
        service,
        pki_id,
        endpoint: endpoint.to_string(),
        _files: files,
    }
}

/// Poll until the condition holds or the timeout expires.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
