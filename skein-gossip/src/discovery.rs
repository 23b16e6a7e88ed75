//! Discovery
//!
//! Owns the peer table and runs the membership protocols: periodic alive
//! emission, alive-timestamp reconciliation, aliveness expiry and the
//! membership request/response anti-entropy exchange.
//!
//! Discovery never reaches back into the service; it talks through two
//! injected seams. `DiscoveryComm` hides the emitter and the comm server,
//! `DiscoverySecurity` hides signing and alive-message validation.

use crate::msg_store::MessageStore;
use futures_util::future::BoxFuture;
use skein_model::{GossipConfig, GossipError, NetworkMember, PeerTime, PkiId};
use skein_net::comm::ReceivedMessage;
use skein_proto::{
    Content, Envelope, MembershipRequest, MembershipResponse, RkSyncMessage, SignedMessage, Tag,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Comm abilities discovery needs, implemented by the service adapter.
#[async_trait::async_trait]
pub trait DiscoveryComm: Send + Sync + 'static {
    /// Push a self-originated message into the gossip emitter (all peers).
    fn gossip(&self, msg: SignedMessage);

    /// Relay a received message onward, excluding its sender.
    fn forward(&self, msg: &ReceivedMessage);

    /// Direct send to one peer. Membership requests are re-wrapped here
    /// with the disclosure policy's envelope filter.
    async fn send_to_peer(&self, peer: &NetworkMember, msg: SignedMessage);

    /// One-shot reachability probe.
    async fn ping(&self, peer: &NetworkMember) -> bool;

    /// Tear down the peer's cached connection.
    fn close_conn(&self, peer: &NetworkMember);
}

/// Crypto abilities discovery needs.
pub trait DiscoverySecurity: Send + Sync + 'static {
    /// Validate an alive message end to end: shape, known or embedded
    /// identity, envelope signature.
    fn validate_alive_msg(&self, msg: &SignedMessage) -> bool;

    /// Sign a self message. Alive messages embed the node's identity while
    /// the publish-cert warm-up window is open. `None` when signing fails;
    /// the failure is logged at the adapter.
    fn sign_message(&self, msg: RkSyncMessage) -> Option<SignedMessage>;
}

/// Whether a message may be revealed to a peer at all.
pub type Sieve = Arc<dyn Fn(&SignedMessage) -> bool + Send + Sync>;

/// A possibly-redacted clone of a message's envelope.
pub type EnvelopeFilter = Arc<dyn Fn(&SignedMessage) -> Envelope + Send + Sync>;

/// Per-remote-peer disclosure decision.
pub type DisclosurePolicy = Arc<dyn Fn(&NetworkMember) -> (Sieve, EnvelopeFilter) + Send + Sync>;

/// Resolves a bootstrap endpoint to a PKI-id, normally via handshake.
pub type PkiResolver = Arc<dyn Fn() -> BoxFuture<'static, Result<PkiId, GossipError>> + Send + Sync>;

/// Discovery timing knobs, extracted from the gossip config.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub alive_time_interval: Duration,
    pub alive_expiration_timeout: Duration,
    pub msg_expiration_factor: u32,
    pub reconnect_interval: Duration,
}

impl From<&GossipConfig> for DiscoveryConfig {
    fn from(cfg: &GossipConfig) -> Self {
        Self {
            alive_time_interval: cfg.alive_time_interval,
            alive_expiration_timeout: cfg.alive_expiration_timeout,
            msg_expiration_factor: cfg.msg_expiration_factor,
            reconnect_interval: cfg.alive_time_interval,
        }
    }
}

struct TsRecord {
    last_seen: Instant,
    time: PeerTime,
}

#[derive(Default)]
struct PeerTable {
    seq_num: u64,
    id2member: HashMap<PkiId, NetworkMember>,
    alive_last_ts: HashMap<PkiId, TsRecord>,
    dead_last_ts: HashMap<PkiId, TsRecord>,
    alive_membership: HashMap<PkiId, SignedMessage>,
    dead_membership: HashMap<PkiId, SignedMessage>,
    self_alive: Option<SignedMessage>,
}

/// The membership subsystem.
pub struct Discovery {
    self_member: NetworkMember,
    inc_num: u64,
    comm: Arc<dyn DiscoveryComm>,
    crypt: Arc<dyn DiscoverySecurity>,
    cfg: DiscoveryConfig,
    policy: DisclosurePolicy,
    table: Arc<Mutex<PeerTable>>,
    msg_store: Arc<MessageStore>,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Discovery {
    pub fn new(
        self_member: NetworkMember,
        comm: Arc<dyn DiscoveryComm>,
        crypt: Arc<dyn DiscoverySecurity>,
        cfg: DiscoveryConfig,
        policy: DisclosurePolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let table: Arc<Mutex<PeerTable>> = Arc::new(Mutex::new(PeerTable::default()));

        // full eviction: once a peer's alive message ages out of the store,
        // every trace of the peer goes with it
        let evict_table = table.clone();
        let msg_store = Arc::new(MessageStore::expirable(
            skein_proto::alive_message_comparator,
            cfg.alive_expiration_timeout * cfg.msg_expiration_factor,
            None,
            Some(Box::new(move |expired: &[SignedMessage]| {
                let mut table = evict_table.lock().expect("peer table poisoned");
                for msg in expired {
                    let Some(pki) = alive_pki_id(msg) else { continue };
                    table.id2member.remove(&pki);
                    table.alive_last_ts.remove(&pki);
                    table.dead_last_ts.remove(&pki);
                    table.alive_membership.remove(&pki);
                    table.dead_membership.remove(&pki);
                    tracing::debug!(peer = %pki, "peer evicted from membership");
                }
            })),
        ));

        // boot epoch: nanoseconds since the UNIX epoch, monotonic across
        // restarts as long as the clock moves forward
        let inc_num = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Arc::new(Self {
            self_member,
            inc_num,
            comm,
            crypt,
            cfg,
            policy,
            table,
            msg_store,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the discovery loops: inbound handling, periodic alive
    /// emission, the aliveness sweep and presumed-dead intake.
    pub fn start(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<ReceivedMessage>,
        mut presumed_dead: mpsc::Receiver<PkiId>,
    ) {
        let mut handles = self.tasks.lock().expect("discovery tasks poisoned");

        let disc = self.clone();
        let mut shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    msg = inbound.recv() => {
                        let Some(msg) = msg else { break };
                        disc.handle_message(msg).await;
                    }
                }
            }
            tracing::debug!("discovery inbound loop exiting");
        }));

        let disc = self.clone();
        let mut shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(disc.cfg.alive_time_interval);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    _ = ticker.tick() => disc.emit_alive(),
                }
            }
            tracing::debug!("alive emission loop exiting");
        }));

        let disc = self.clone();
        let mut shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(disc.cfg.alive_time_interval);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    _ = ticker.tick() => disc.check_aliveness(),
                }
            }
            tracing::debug!("aliveness sweep loop exiting");
        }));

        let disc = self.clone();
        let mut shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    pki = presumed_dead.recv() => {
                        let Some(pki) = pki else { break };
                        disc.mark_dead(&pki);
                    }
                }
            }
            tracing::debug!("presumed-dead loop exiting");
        }));
    }

    /// Alive members, excluding self.
    pub fn membership(&self) -> Vec<NetworkMember> {
        let table = self.table.lock().expect("peer table poisoned");
        table
            .alive_last_ts
            .keys()
            .filter_map(|pki| table.id2member.get(pki).cloned())
            .collect()
    }

    /// Members currently held in the dead set.
    pub fn dead_peers(&self) -> Vec<NetworkMember> {
        let table = self.table.lock().expect("peer table poisoned");
        table
            .dead_last_ts
            .keys()
            .filter_map(|pki| table.id2member.get(pki).cloned())
            .collect()
    }

    /// Resolve a known peer (alive or dead) by PKI-id.
    pub fn lookup(&self, pki_id: &PkiId) -> Option<NetworkMember> {
        let table = self.table.lock().expect("peer table poisoned");
        table.id2member.get(pki_id).cloned()
    }

    /// Highest timestamp ever accepted from a peer.
    pub fn peer_time(&self, pki_id: &PkiId) -> Option<PeerTime> {
        let table = self.table.lock().expect("peer table poisoned");
        table
            .alive_last_ts
            .get(pki_id)
            .or_else(|| table.dead_last_ts.get(pki_id))
            .map(|rec| rec.time)
    }

    /// One pull round: membership requests to `k` random alive peers.
    pub async fn initiate_sync(&self, k: usize) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(request) = self.membership_request() else {
            // no alive message emitted yet, nothing to introduce ourselves with
            return;
        };
        let members = self.membership();
        let peers = crate::filter::select_peers(k, &members, &crate::filter::select_all());
        for peer in peers {
            tracing::trace!(peer = %peer, "membership sync request");
            self.comm.send_to_peer(&peer, request.clone()).await;
        }
    }

    /// Bootstrap path: keep resolving the endpoint's PKI-id and sending it
    /// membership requests until the peer shows up in the table.
    pub fn connect(self: &Arc<Self>, member: NetworkMember, resolver: PkiResolver) {
        let disc = self.clone();
        let mut shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !disc.comm.ping(&member).await {
                    tracing::debug!(peer = %member, "bootstrap peer unreachable, will retry");
                } else {
                    match resolver().await {
                        Ok(pki) => {
                            if disc.lookup(&pki).is_some() {
                                tracing::debug!(peer = %member, "bootstrap peer joined membership");
                                break;
                            }
                            if let Some(request) = disc.membership_request() {
                                let target = NetworkMember::new(member.endpoint.clone(), pki);
                                disc.comm.send_to_peer(&target, request).await;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(peer = %member, error = %e, "bootstrap handshake failed, will retry");
                        }
                    }
                }
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    _ = tokio::time::sleep(disc.cfg.reconnect_interval) => {}
                }
            }
        });
        self.tasks.lock().expect("discovery tasks poisoned").push(handle);
    }

    /// Stop the loops. The shutdown watch has already been flipped by the
    /// service; aborting covers tasks parked on queues that never close.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let tasks = {
            let mut guard = self.tasks.lock().expect("discovery tasks poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
    }

    async fn handle_message(&self, m: ReceivedMessage) {
        match &m.msg.message.content {
            Some(Content::AliveMsg(_)) => self.handle_alive(&m).await,
            Some(Content::MemReq(_)) => self.handle_membership_request(&m).await,
            Some(Content::MemRes(_)) => self.handle_membership_response(&m),
            _ => {
                tracing::debug!(kind = m.msg.message.content_kind(), "non-discovery message dropped");
            }
        }
    }

    async fn handle_alive(&self, m: &ReceivedMessage) {
        let Some(newcomer) = self.process_alive(&m.msg) else {
            return;
        };
        if let Some(peer) = newcomer {
            // an unknown peer introduced itself; ask it for its view
            if let Some(request) = self.membership_request() {
                self.comm.send_to_peer(&peer, request).await;
            }
        }
        self.comm.forward(m);
    }

    /// Validate and absorb an alive message.
    ///
    /// Returns `None` when the message was invalid or stale, `Some(None)`
    /// when it refreshed a known peer, and `Some(Some(member))` when it
    /// introduced an unknown peer.
    fn process_alive(&self, signed: &SignedMessage) -> Option<Option<NetworkMember>> {
        let alive = signed.message.alive()?;
        let membership = alive.membership.as_ref()?;
        let pki = PkiId::from_slice(&membership.pki_id)?;
        if pki == self.self_member.pki_id {
            return None;
        }
        if !self.crypt.validate_alive_msg(signed) {
            tracing::warn!(peer = %pki, "alive message failed validation");
            return None;
        }
        let time: PeerTime = alive.timestamp.map(Into::into).unwrap_or(PeerTime::new(0, 0));

        // the store is the ordering authority: stale or duplicate
        // timestamps never get past it
        if !self.msg_store.add(signed.clone()) {
            tracing::trace!(peer = %pki, "stale alive message discarded");
            return None;
        }

        let member = NetworkMember {
            endpoint: membership.endpoint.clone(),
            pki_id: pki,
            metadata: membership.metadata.clone(),
        };

        let mut table = self.table.lock().expect("peer table poisoned");
        let was_known = table.id2member.contains_key(&pki);
        let was_dead = table.dead_last_ts.contains_key(&pki);

        if was_dead {
            tracing::info!(peer = %pki, "dead peer resurrected");
            table.dead_last_ts.remove(&pki);
            table.dead_membership.remove(&pki);
        }

        table.id2member.insert(pki, member.clone());
        table.alive_last_ts.insert(
            pki,
            TsRecord {
                last_seen: Instant::now(),
                time,
            },
        );
        table.alive_membership.insert(pki, signed.clone());

        if was_known {
            Some(None)
        } else {
            tracing::info!(peer = %member, "new peer discovered");
            Some(Some(member))
        }
    }

    async fn handle_membership_request(&self, m: &ReceivedMessage) {
        let Some(req) = m.msg.message.mem_req() else { return };
        let Some(self_info) = req.self_information.as_ref() else {
            tracing::warn!("membership request without self information");
            return;
        };
        let requester_info = match self_info.to_signed_message() {
            Ok(signed) => signed,
            Err(e) => {
                tracing::warn!(error = %e, "membership request with undecodable self information");
                return;
            }
        };
        if !requester_info.message.is_alive_msg() {
            tracing::warn!("membership request self information is not an alive message");
            return;
        }

        // absorb the requester itself
        self.process_alive(&requester_info);

        let requester = requester_member(&requester_info, &m.info.endpoint);
        let mut known: HashSet<Vec<u8>> = req.known.iter().cloned().collect();
        known.insert(requester.pki_id.as_bytes().to_vec());

        let response = self.membership_response(&known, &requester);
        let msg = RkSyncMessage {
            nonce: m.msg.message.nonce,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::MemRes(response)),
        };
        let Some(signed) = self.crypt.sign_message(msg) else {
            tracing::warn!("failed signing membership response");
            return;
        };
        m.respond(&signed);
    }

    /// The local view minus the requester's known set, filtered through the
    /// disclosure policy for that requester.
    fn membership_response(
        &self,
        known: &HashSet<Vec<u8>>,
        requester: &NetworkMember,
    ) -> MembershipResponse {
        let (sieve, envelope_filter) = (self.policy)(requester);
        let table = self.table.lock().expect("peer table poisoned");

        let mut alive: Vec<Envelope> = Vec::new();
        if let Some(self_alive) = &table.self_alive {
            if sieve(self_alive) {
                alive.push(envelope_filter(self_alive));
            }
        }
        for (pki, msg) in &table.alive_membership {
            if !known.contains(pki.as_bytes().as_slice()) && sieve(msg) {
                alive.push(envelope_filter(msg));
            }
        }
        let dead: Vec<Envelope> = table
            .dead_membership
            .iter()
            .filter(|(pki, msg)| !known.contains(pki.as_bytes().as_slice()) && sieve(msg))
            .map(|(_, msg)| envelope_filter(msg))
            .collect();
        MembershipResponse { alive, dead }
    }

    fn handle_membership_response(&self, m: &ReceivedMessage) {
        let Some(res) = m.msg.message.mem_res() else { return };

        for envelope in &res.alive {
            match envelope.to_signed_message() {
                Ok(signed) if signed.message.is_alive_msg() => {
                    self.process_alive(&signed);
                }
                Ok(_) => tracing::warn!("membership response alive entry is not an alive message"),
                Err(e) => tracing::warn!(error = %e, "undecodable alive entry in membership response"),
            }
        }

        for envelope in &res.dead {
            let Ok(signed) = envelope.to_signed_message() else { continue };
            let Some(pki) = alive_pki_id(&signed) else { continue };
            if pki == self.self_member.pki_id {
                continue;
            }
            if !self.crypt.validate_alive_msg(&signed) {
                continue;
            }
            let time = signed
                .message
                .alive()
                .and_then(|a| a.timestamp)
                .map(PeerTime::from)
                .unwrap_or(PeerTime::new(0, 0));

            let mut table = self.table.lock().expect("peer table poisoned");
            if table.alive_last_ts.contains_key(&pki) || table.dead_last_ts.contains_key(&pki) {
                continue;
            }
            let member = requester_member(&signed, "");
            tracing::debug!(peer = %pki, "learned dead peer from membership response");
            table.id2member.insert(pki, member);
            table.dead_last_ts.insert(
                pki,
                TsRecord {
                    last_seen: Instant::now(),
                    time,
                },
            );
            table.dead_membership.insert(pki, signed);
        }
    }

    fn emit_alive(&self) {
        let time = {
            let mut table = self.table.lock().expect("peer table poisoned");
            table.seq_num += 1;
            PeerTime::new(self.inc_num, table.seq_num)
        };
        let msg = RkSyncMessage {
            nonce: rand::random(),
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::AliveMsg(skein_proto::AliveMessage {
                membership: Some(self.self_member.clone().into()),
                timestamp: Some(time.into()),
                identity: vec![],
            })),
        };
        let Some(signed) = self.crypt.sign_message(msg) else {
            tracing::warn!("failed signing alive message");
            return;
        };
        {
            let mut table = self.table.lock().expect("peer table poisoned");
            table.self_alive = Some(signed.clone());
        }
        self.comm.gossip(signed);
    }

    fn check_aliveness(&self) {
        let expired: Vec<NetworkMember> = {
            let mut table = self.table.lock().expect("peer table poisoned");
            let timeout = self.cfg.alive_expiration_timeout;
            let expired: Vec<PkiId> = table
                .alive_last_ts
                .iter()
                .filter(|(_, rec)| rec.last_seen.elapsed() > timeout)
                .map(|(pki, _)| *pki)
                .collect();
            expired
                .iter()
                .filter_map(|pki| move_to_dead(&mut table, pki))
                .collect()
        };
        for member in &expired {
            tracing::info!(peer = %member, "peer expired into dead set");
            self.comm.close_conn(member);
        }
        // entries past expiration × factor drop out of the store, and the
        // eviction hook forgets the peers entirely
        self.msg_store.sweep();
    }

    fn mark_dead(&self, pki: &PkiId) {
        let moved = {
            let mut table = self.table.lock().expect("peer table poisoned");
            move_to_dead(&mut table, pki)
        };
        if let Some(member) = moved {
            tracing::info!(peer = %member, "peer presumed dead");
            self.comm.close_conn(&member);
        }
    }

    fn membership_request(&self) -> Option<SignedMessage> {
        let table = self.table.lock().expect("peer table poisoned");
        let self_alive = table.self_alive.as_ref()?;
        let known: Vec<Vec<u8>> = table
            .id2member
            .keys()
            .map(|pki| pki.as_bytes().to_vec())
            .collect();
        let msg = RkSyncMessage {
            nonce: rand::random(),
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::MemReq(MembershipRequest {
                self_information: Some(self_alive.envelope.clone()),
                known,
            })),
        };
        // outer request rides unsigned: authenticity comes from the signed
        // self information plus the transport handshake
        Some(SignedMessage::noop_sign(msg))
    }
}

/// Move a peer from the alive records to the dead records.
fn move_to_dead(table: &mut PeerTable, pki: &PkiId) -> Option<NetworkMember> {
    let rec = table.alive_last_ts.remove(pki)?;
    let msg = table.alive_membership.remove(pki);
    table.dead_last_ts.insert(
        *pki,
        TsRecord {
            last_seen: rec.last_seen,
            time: rec.time,
        },
    );
    if let Some(msg) = msg {
        table.dead_membership.insert(*pki, msg);
    }
    table.id2member.get(pki).cloned()
}

fn alive_pki_id(msg: &SignedMessage) -> Option<PkiId> {
    msg.message
        .alive()
        .and_then(|a| a.membership.as_ref())
        .and_then(|m| PkiId::from_slice(&m.pki_id))
}

fn requester_member(signed: &SignedMessage, fallback_endpoint: &str) -> NetworkMember {
    let (endpoint, pki, metadata) = signed
        .message
        .alive()
        .and_then(|a| a.membership.as_ref())
        .map(|m| (m.endpoint.clone(), m.pki_id.clone(), m.metadata.clone()))
        .unwrap_or_default();
    let endpoint = if endpoint.is_empty() {
        fallback_endpoint.to_string()
    } else {
        endpoint
    };
    NetworkMember {
        endpoint,
        pki_id: PkiId::from_slice(&pki).unwrap_or(PkiId([0u8; 32])),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_net::comm::ConnectionInfo;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockComm {
        gossiped: StdMutex<Vec<SignedMessage>>,
        forwarded: StdMutex<Vec<SignedMessage>>,
        sent: StdMutex<Vec<(NetworkMember, SignedMessage)>>,
        closed: StdMutex<Vec<PkiId>>,
    }

    #[async_trait::async_trait]
    impl DiscoveryComm for MockComm {
        fn gossip(&self, msg: SignedMessage) {
            self.gossiped.lock().unwrap().push(msg);
        }
        fn forward(&self, msg: &ReceivedMessage) {
            self.forwarded.lock().unwrap().push(msg.msg.clone());
        }
        async fn send_to_peer(&self, peer: &NetworkMember, msg: SignedMessage) {
            self.sent.lock().unwrap().push((peer.clone(), msg));
        }
        async fn ping(&self, _peer: &NetworkMember) -> bool {
            true
        }
        fn close_conn(&self, peer: &NetworkMember) {
            self.closed.lock().unwrap().push(peer.pki_id);
        }
    }

    struct AcceptAll;
    impl DiscoverySecurity for AcceptAll {
        fn validate_alive_msg(&self, _msg: &SignedMessage) -> bool {
            true
        }
        fn sign_message(&self, msg: RkSyncMessage) -> Option<SignedMessage> {
            Some(SignedMessage::noop_sign(msg))
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            alive_time_interval: Duration::from_millis(50),
            alive_expiration_timeout: Duration::from_millis(100),
            msg_expiration_factor: 2,
            reconnect_interval: Duration::from_millis(50),
        }
    }

    fn reveal_everything() -> DisclosurePolicy {
        Arc::new(|_remote: &NetworkMember| {
            let sieve: Sieve = Arc::new(|_msg: &SignedMessage| true);
            let filter: EnvelopeFilter = Arc::new(|msg: &SignedMessage| msg.envelope.clone());
            (sieve, filter)
        })
    }

    fn discovery() -> (Arc<Discovery>, Arc<MockComm>, watch::Sender<bool>) {
        let comm = Arc::new(MockComm::default());
        let (tx, rx) = watch::channel(false);
        let disc = Discovery::new(
            NetworkMember::new("self-ep", PkiId([0xFF; 32])),
            comm.clone(),
            Arc::new(AcceptAll),
            config(),
            reveal_everything(),
            rx,
        );
        (disc, comm, tx)
    }

    fn alive_from(pki: u8, endpoint: &str, inc: u64, seq: u64) -> SignedMessage {
        SignedMessage::noop_sign(RkSyncMessage {
            nonce: 1,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::AliveMsg(skein_proto::AliveMessage {
                membership: Some(skein_proto::Member {
                    endpoint: endpoint.into(),
                    pki_id: vec![pki; 32],
                    metadata: vec![],
                }),
                timestamp: Some(skein_proto::PeerTime {
                    inc_num: inc,
                    seq_num: seq,
                }),
                identity: vec![],
            })),
        })
    }

    fn received(msg: SignedMessage, sender: u8) -> (ReceivedMessage, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        let info = Arc::new(ConnectionInfo {
            pki_id: PkiId([sender; 32]),
            identity: vec![],
            endpoint: format!("ep-{sender}"),
        });
        (ReceivedMessage::new(msg, info, tx), rx)
    }

    #[tokio::test]
    async fn unknown_peer_is_learned_and_probed_for_membership() {
        let (disc, comm, _sd) = discovery();
        disc.emit_alive();

        let (msg, _reply) = received(alive_from(1, "ep-1", 1, 1), 1);
        disc.handle_message(msg).await;

        let members = disc.membership();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].pki_id, PkiId([1; 32]));

        // the newcomer got a membership request, and the alive was forwarded
        let sent = comm.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.message.mem_req().is_some());
        assert_eq!(comm.forwarded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_timestamps_are_discarded() {
        let (disc, comm, _sd) = discovery();

        let (fresh, _r1) = received(alive_from(1, "ep-1", 1, 5), 1);
        disc.handle_message(fresh).await;
        assert_eq!(disc.peer_time(&PkiId([1; 32])), Some(PeerTime::new(1, 5)));

        let (stale, _r2) = received(alive_from(1, "ep-1", 1, 4), 1);
        disc.handle_message(stale).await;
        let (dup, _r3) = received(alive_from(1, "ep-1", 1, 5), 1);
        disc.handle_message(dup).await;

        // timestamp is still the maximum ever seen, nothing re-forwarded
        assert_eq!(disc.peer_time(&PkiId([1; 32])), Some(PeerTime::new(1, 5)));
        assert_eq!(comm.forwarded.lock().unwrap().len(), 1);

        let (newer, _r4) = received(alive_from(1, "ep-1", 2, 0), 1);
        disc.handle_message(newer).await;
        assert_eq!(disc.peer_time(&PkiId([1; 32])), Some(PeerTime::new(2, 0)));
    }

    #[tokio::test]
    async fn membership_request_gets_view_minus_known() {
        let (disc, _comm, _sd) = discovery();
        disc.emit_alive();

        for pki in [1u8, 2, 3] {
            let (msg, _r) = received(alive_from(pki, &format!("ep-{pki}"), 1, 1), pki);
            disc.handle_message(msg).await;
        }

        // requester 9 already knows peer 2
        let requester_alive = alive_from(9, "ep-9", 1, 1);
        let request = SignedMessage::noop_sign(RkSyncMessage {
            nonce: 77,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::MemReq(MembershipRequest {
                self_information: Some(requester_alive.envelope.clone()),
                known: vec![vec![2u8; 32]],
            })),
        });
        let (msg, mut reply) = received(request, 9);
        disc.handle_message(msg).await;

        let envelope = reply.try_recv().expect("membership response");
        let response = envelope.to_signed_message().expect("decode");
        assert_eq!(response.message.nonce, 77);
        let res = response.message.mem_res().expect("mem res");

        let mut returned: Vec<PkiId> = res
            .alive
            .iter()
            .filter_map(|env| env.to_signed_message().ok())
            .filter_map(|signed| alive_pki_id(&signed))
            .collect();
        returned.sort();
        // self, peer 1 and peer 3; peer 2 and the requester are excluded
        assert_eq!(
            returned,
            vec![PkiId([1; 32]), PkiId([3; 32]), PkiId([0xFF; 32])]
        );

        // the requester itself was learned
        assert!(disc.lookup(&PkiId([9; 32])).is_some());
    }

    #[tokio::test]
    async fn silent_peer_expires_to_dead_then_is_evicted() {
        let (disc, comm, _sd) = discovery();

        let (msg, _r) = received(alive_from(1, "ep-1", 1, 1), 1);
        disc.handle_message(msg).await;
        assert_eq!(disc.membership().len(), 1);

        // past the expiration timeout: alive → dead, connection closed
        tokio::time::sleep(Duration::from_millis(120)).await;
        disc.check_aliveness();
        assert!(disc.membership().is_empty());
        assert_eq!(disc.dead_peers().len(), 1);
        assert_eq!(comm.closed.lock().unwrap().as_slice(), &[PkiId([1; 32])]);

        // past expiration × factor: evicted entirely
        tokio::time::sleep(Duration::from_millis(120)).await;
        disc.check_aliveness();
        assert!(disc.dead_peers().is_empty());
        assert!(disc.lookup(&PkiId([1; 32])).is_none());
    }

    #[tokio::test]
    async fn resurrection_moves_peer_back_to_alive() {
        let (disc, _comm, _sd) = discovery();

        let (msg, _r) = received(alive_from(1, "ep-1", 1, 1), 1);
        disc.handle_message(msg).await;
        disc.mark_dead(&PkiId([1; 32]));
        assert!(disc.membership().is_empty());
        assert_eq!(disc.dead_peers().len(), 1);

        let (newer, _r2) = received(alive_from(1, "ep-1", 1, 2), 1);
        disc.handle_message(newer).await;
        assert_eq!(disc.membership().len(), 1);
        assert!(disc.dead_peers().is_empty());
    }

    #[tokio::test]
    async fn membership_response_teaches_alive_and_dead_peers() {
        let (disc, _comm, _sd) = discovery();

        let response = SignedMessage::noop_sign(RkSyncMessage {
            nonce: 0,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::MemRes(MembershipResponse {
                alive: vec![alive_from(1, "ep-1", 1, 1).envelope],
                dead: vec![alive_from(2, "ep-2", 1, 1).envelope],
            })),
        });
        let (msg, _r) = received(response, 3);
        disc.handle_message(msg).await;

        assert_eq!(disc.membership().len(), 1);
        assert_eq!(disc.dead_peers().len(), 1);
        assert!(disc.lookup(&PkiId([2; 32])).is_some());
    }
}
