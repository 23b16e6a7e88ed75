//! End-to-end gossip tests over the in-memory transport
//!
//! Small clusters of full GossipService instances: bootstrap convergence,
//! channel state propagation to a follower, leader restarts and peer death.

mod common;

use common::{spawn_node, wait_until};
use skein_model::{FileMode, FileSyncInfo, GossipError, PkiId};
use skein_net_sim::ChannelNetwork;
use std::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread")]
async fn two_node_bootstrap_converges() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;
    let b = spawn_node("b", vec!["a".into()], &network).await;

    let (pki_a, pki_b) = (a.pki_id, b.pki_id);
    assert!(
        wait_until(CONVERGENCE, || {
            let a_sees_b = a.service.peers().iter().any(|m| m.pki_id == pki_b);
            let b_sees_a = b.service.peers().iter().any(|m| m.pki_id == pki_a);
            a_sees_b && b_sees_a
        })
        .await,
        "both nodes should learn each other within a pull interval"
    );

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn third_node_is_learned_transitively() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;
    let b = spawn_node("b", vec!["a".into()], &network).await;
    // c only knows b; it must still learn a through gossip
    let c = spawn_node("c", vec!["b".into()], &network).await;

    let (pki_a, pki_c) = (a.pki_id, c.pki_id);
    assert!(
        wait_until(CONVERGENCE, || {
            let c_sees_a = c.service.peers().iter().any(|m| m.pki_id == pki_a);
            let a_sees_c = a.service.peers().iter().any(|m| m.pki_id == pki_c);
            c_sees_a && a_sees_c
        })
        .await,
        "membership should spread beyond direct bootstrap links"
    );

    a.service.stop().await;
    b.service.stop().await;
    c.service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_state_reaches_added_member() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;
    let b = spawn_node("b", vec!["a".into()], &network).await;
    let (pki_a, pki_b) = (a.pki_id, b.pki_id);

    assert!(
        wait_until(CONVERGENCE, || {
            a.service.peers().iter().any(|m| m.pki_id == pki_b)
        })
        .await,
        "bootstrap must converge before the channel test"
    );

    let s1 = a
        .service
        .create_channel("c1", vec![FileSyncInfo::new("log.dat", FileMode::Append)])
        .expect("create channel");
    assert_eq!(s1.seq_num, 1);

    let s2 = a
        .service
        .add_member_to_chan("c1", pki_b)
        .expect("add member");
    assert_eq!(s2.seq_num, 2);

    // b receives the state through gossip, verifies the leader signature
    // and joins as a follower
    assert!(
        wait_until(CONVERGENCE, || {
            b.service
                .self_channel_info("c1")
                .is_some_and(|state| state.seq_num >= 2)
        })
        .await,
        "the follower should adopt the channel state"
    );

    let adopted = b.service.self_channel_info("c1").expect("adopted state");
    let info = adopted.chain_state_info().expect("state info");
    assert_eq!(info.leader, pki_a.as_bytes().to_vec());
    let mut members: Vec<Vec<u8>> = info.members;
    members.sort();
    let mut expected = vec![pki_a.as_bytes().to_vec(), pki_b.as_bytes().to_vec()];
    expected.sort();
    assert_eq!(members, expected);

    // a follow-up mutation propagates too
    let s3 = a
        .service
        .add_file_to_chan("c1", FileSyncInfo::new("extra.dat", FileMode::Random))
        .expect("add file");
    assert_eq!(s3.seq_num, 3);
    assert!(
        wait_until(CONVERGENCE, || {
            b.service
                .self_channel_info("c1")
                .is_some_and(|state| state.seq_num >= 3)
        })
        .await,
        "the follower should track subsequent states"
    );

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_peer_leaves_the_membership() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;
    let b = spawn_node("b", vec!["a".into()], &network).await;
    let pki_b = b.pki_id;

    assert!(
        wait_until(CONVERGENCE, || {
            a.service.peers().iter().any(|m| m.pki_id == pki_b)
        })
        .await,
        "bootstrap must converge first"
    );

    // silence b entirely
    b.service.stop().await;
    network.disconnect(&b.endpoint).await;

    assert!(
        wait_until(CONVERGENCE, || {
            !a.service.peers().iter().any(|m| m.pki_id == pki_b)
        })
        .await,
        "a silent peer should expire out of the alive set"
    );

    a.service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_channel_rejects_foreign_mac() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;
    let b = spawn_node("b", vec![], &network).await;

    // a state whose MAC derives from b, offered to a
    let state = b.service.create_channel("c1", vec![]).expect("create");
    let err = a
        .service
        .initialize_channel("c1", state)
        .expect_err("foreign MAC must be rejected");
    assert!(matches!(err, GossipError::InvalidInput(_)));
    assert!(a.service.self_channel_info("c1").is_none());

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_channel_readopts_own_state() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;

    let state = a
        .service
        .create_channel("c1", vec![FileSyncInfo::new("f", FileMode::Append)])
        .expect("create");
    a.service.close_channel("c1");
    assert!(a.service.self_channel_info("c1").is_none());

    // restart path: the persisted state is adopted again as leader
    a.service
        .initialize_channel("c1", state.clone())
        .expect("re-initialize");
    let readopted = a.service.self_channel_info("c1").expect("state");
    assert_eq!(readopted.seq_num, state.seq_num);

    // and the channel is mutable again
    let s2 = a
        .service
        .add_member_to_chan("c1", PkiId([7u8; 32]))
        .expect("mutate after restart");
    assert_eq!(s2.seq_num, 2);

    a.service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_channel_requires_id_and_running_service() {
    let network = ChannelNetwork::new();
    let a = spawn_node("a", vec![], &network).await;

    assert!(matches!(
        a.service.create_channel("", vec![]),
        Err(GossipError::InvalidInput(_))
    ));

    a.service.stop().await;
    assert!(matches!(
        a.service.create_channel("c1", vec![]),
        Err(GossipError::Stopped)
    ));
    assert!(a.service.peers().is_empty());
}
