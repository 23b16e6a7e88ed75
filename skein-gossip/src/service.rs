//! Gossip service
//!
//! The top-level orchestrator: wires the identity mapper, comm server,
//! batching emitter, discovery and the channel registry together, runs the
//! inbound routing loop and owns the lifecycle.
//!
//! Components never reference the service directly; each gets a small
//! adapter (`DiscoveryComm`, `DiscoverySecurity`, `ChannelAdapter`) and
//! the emitter calls back through a weak handle.

use crate::channel::{ChannelAdapter, ChannelRegistry};
use crate::discovery::{
    DisclosurePolicy, Discovery, DiscoveryComm, DiscoverySecurity, EnvelopeFilter, PkiResolver,
    Sieve,
};
use crate::emitter::{BatchingEmitter, EmittedMessage};
use crate::filter::{combine, select_peers, RoutingFilter};
use crate::identity_map::IdentityMapper;
use crate::msg_store::MessageStore;
use futures_util::future::BoxFuture;
use skein_model::{
    CommConfig, FileSystem, GossipConfig, GossipError, IdentityConfig, NetworkMember,
    NodeIdentity, PkiId,
};
use skein_net::comm::{Comm, ReceivedMessage};
use skein_net::transport::Transport;
use skein_proto::{
    ChainState, Content, MembershipRequest, ProtoError, RkSyncMessage, SignedMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const DISCOVERY_QUEUE_DEPTH: usize = 100;

/// The gossip engine. One instance per node, generic over the transport.
pub struct GossipService<T: Transport> {
    cfg: GossipConfig,
    self_pki_id: PkiId,
    id_mapper: Arc<IdentityMapper>,
    comm: Arc<Comm<T>>,
    emitter: Arc<BatchingEmitter>,
    disc: Arc<Discovery>,
    channels: Arc<ChannelRegistry>,
    chain_state_store: Arc<MessageStore>,
    disc_inbound_tx: mpsc::Sender<ReceivedMessage>,
    stop_flag: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> GossipService<T> {
    /// Build the engine and launch its loops.
    pub fn spawn(
        cfg: GossipConfig,
        identity_cfg: IdentityConfig,
        comm_cfg: CommConfig,
        node: NodeIdentity,
        transport: Arc<T>,
        fs: Arc<dyn FileSystem>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let id_mapper = Arc::new(IdentityMapper::new(
            node,
            &identity_cfg.node_id,
            identity_cfg.identity_usage_ttl,
        ));
        let self_pki_id = id_mapper.self_pki_id();

        let comm = Comm::new(
            transport,
            id_mapper.clone(),
            comm_cfg,
            shutdown_rx.clone(),
        );
        // purged identities lose their connection too
        {
            let comm_weak = Arc::downgrade(&comm);
            id_mapper.set_purge_hook(move |pki| {
                if let Some(comm) = comm_weak.upgrade() {
                    comm.close_conn(pki);
                }
            });
        }

        let (disc_inbound_tx, disc_inbound_rx) = mpsc::channel(DISCOVERY_QUEUE_DEPTH);
        let (presumed_dead_tx, presumed_dead_rx) = mpsc::channel(DISCOVERY_QUEUE_DEPTH);

        let policy = default_disclosure_policy();

        let service = Arc::new_cyclic(|weak: &Weak<Self>| {
            let emit_weak = weak.clone();
            let emitter = Arc::new(BatchingEmitter::new(
                cfg.max_propagation_burst_size,
                cfg.max_propagation_burst_latency,
                Arc::new(move |batch| -> BoxFuture<'static, ()> {
                    let weak = emit_weak.clone();
                    Box::pin(async move {
                        if let Some(service) = weak.upgrade() {
                            service.gossip_batch(batch).await;
                        }
                    })
                }),
                shutdown_rx.clone(),
            ));

            let disc_adapter = Arc::new(DiscoveryAdapter {
                comm: comm.clone(),
                emitter: emitter.clone(),
                policy: policy.clone(),
                propagate_iterations: cfg.propagate_iterations,
            });
            let security = Arc::new(SecurityAdapter {
                id_mapper: id_mapper.clone(),
                include_identity_until: Instant::now() + cfg.publish_cert_period,
            });
            let self_member = NetworkMember::new(cfg.endpoint.clone(), self_pki_id);
            let disc = Discovery::new(
                self_member,
                disc_adapter,
                security,
                (&cfg).into(),
                policy.clone(),
                shutdown_rx.clone(),
            );

            let chan_adapter = Arc::new(ChanAdapter {
                comm: comm.clone(),
                emitter: emitter.clone(),
                disc: disc.clone(),
                id_mapper: id_mapper.clone(),
                fs,
            });
            let channels = Arc::new(ChannelRegistry::new(
                chan_adapter,
                (&cfg).into(),
                shutdown_rx.clone(),
            ));

            // chain states age out once the leader has had ample time to
            // republish
            let chain_state_store = Arc::new(MessageStore::expirable(
                skein_proto::chain_state_comparator,
                cfg.publish_state_info_interval * 100,
                None,
                None,
            ));

            GossipService {
                cfg,
                self_pki_id,
                id_mapper,
                comm,
                emitter,
                disc,
                channels,
                chain_state_store,
                disc_inbound_tx,
                stop_flag: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }
        });

        tracing::info!(
            pki_id = %service.self_pki_id,
            endpoint = %service.cfg.endpoint,
            "gossip service starting"
        );
        service.comm.start();
        service.disc.start(disc_inbound_rx, presumed_dead_rx);
        service.start_loops(presumed_dead_tx);
        service.connect_to_bootstrap_peers();
        service
    }

    // ==================== Public API ====================

    /// This node's PKI-id.
    pub fn self_pki_id(&self) -> PkiId {
        self.self_pki_id
    }

    /// The current alive membership view; empty once stopping.
    pub fn peers(&self) -> Vec<NetworkMember> {
        if self.stopping() {
            return Vec::new();
        }
        self.disc.membership()
    }

    /// The chain state this node holds for a channel.
    pub fn self_channel_info(&self, chain_id: &str) -> Option<ChainState> {
        self.channels
            .get(chain_id)
            .and_then(|chan| chan.self_chain_state())
    }

    /// Create a channel with this node as its leader.
    pub fn create_channel(
        &self,
        chain_id: &str,
        files: Vec<skein_model::FileSyncInfo>,
    ) -> Result<ChainState, GossipError> {
        if chain_id.is_empty() {
            return Err(GossipError::InvalidInput("channel id must be provided".into()));
        }
        if self.stopping() {
            return Err(GossipError::Stopped);
        }
        let channel = self.channels.join_channel(chain_id, true);
        channel.initialize(vec![self.self_pki_id], files)
    }

    /// Re-adopt a persisted chain state as the channel leader, typically
    /// after a restart. The MAC must derive from this node and the state
    /// must declare it as leader.
    pub fn initialize_channel(
        &self,
        chain_id: &str,
        state: ChainState,
    ) -> Result<(), GossipError> {
        if chain_id.is_empty() {
            return Err(GossipError::InvalidInput("channel id must be provided".into()));
        }
        if self.stopping() {
            return Err(GossipError::Stopped);
        }

        let mac = skein_model::crypto::chain_mac(&self.self_pki_id, chain_id);
        if state.chain_mac != mac.as_bytes() {
            return Err(GossipError::InvalidInput(format!(
                "channel {chain_id} MAC does not derive from this node"
            )));
        }
        let info = state
            .chain_state_info()
            .map_err(|e| GossipError::InvalidInput(e.to_string()))?;
        if info.leader != self.self_pki_id.as_bytes() {
            return Err(GossipError::InvalidInput(format!(
                "channel {chain_id} state declares a different leader"
            )));
        }

        let channel = self.channels.join_channel(chain_id, true);
        channel.initialize_with_chain_state(state)
    }

    /// Leader operation: admit a member to a channel.
    pub fn add_member_to_chan(
        &self,
        chain_id: &str,
        member: PkiId,
    ) -> Result<ChainState, GossipError> {
        let channel = self
            .channels
            .get(chain_id)
            .ok_or_else(|| GossipError::NotFound(format!("channel {chain_id}")))?;
        channel.add_member(member)
    }

    /// Leader operation: add a file to a channel manifest.
    pub fn add_file_to_chan(
        &self,
        chain_id: &str,
        file: skein_model::FileSyncInfo,
    ) -> Result<ChainState, GossipError> {
        let channel = self
            .channels
            .get(chain_id)
            .ok_or_else(|| GossipError::NotFound(format!("channel {chain_id}")))?;
        channel.add_file(file)
    }

    /// Leave a channel.
    pub fn close_channel(&self, chain_id: &str) {
        if chain_id.is_empty() {
            return;
        }
        self.channels.remove(chain_id);
    }

    /// Subscribe to inbound messages matching a predicate. External
    /// modules (e.g. file transfer) build on this.
    pub fn accept(
        &self,
        predicate: Arc<dyn Fn(&ReceivedMessage) -> bool + Send + Sync>,
    ) -> mpsc::Receiver<ReceivedMessage> {
        self.comm.accept(predicate)
    }

    /// Stop the engine: flag, subsystems, broadcast, emitter drain, comm.
    pub async fn stop(&self) {
        if self.stop_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping gossip service");
        self.disc.stop();
        self.channels.stop();
        let _ = self.shutdown_tx.send(true);
        self.emitter.stop().await;
        let tasks = {
            let mut guard = self.tasks.lock().expect("service tasks poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
        self.comm.stop().await;
        tracing::info!("gossip service stopped");
    }

    fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    // ==================== Loops ====================

    fn start_loops(self: &Arc<Self>, presumed_dead_tx: mpsc::Sender<PkiId>) {
        let mut handles = self.tasks.lock().expect("service tasks poisoned");

        // inbound routing; the comm layer already strips conn/empty frames
        let service = self.clone();
        let mut inbound = self.comm.accept(Arc::new(|_| true));
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    msg = inbound.recv() => {
                        let Some(msg) = msg else { break };
                        service.handle_message(msg).await;
                    }
                }
            }
            tracing::debug!("accept-messages loop exiting");
        }));

        // periodic membership pull plus store/identity sweeps
        let service = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.cfg.pull_interval);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    _ = ticker.tick() => {
                        service.disc.initiate_sync(service.cfg.pull_peer_num).await;
                        service.chain_state_store.sweep();
                        service.id_mapper.sweep();
                    }
                }
            }
            tracing::debug!("discovery sync loop exiting");
        }));

        // unreachable peers flow from the comm layer into discovery
        let mut comm_dead = self
            .comm
            .take_presumed_dead()
            .expect("presumed-dead receiver already taken");
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                    pki = comm_dead.recv() => {
                        let Some(pki) = pki else { break };
                        if presumed_dead_tx.send(pki).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("presumed-dead loop exiting");
        }));
    }

    /// One handshake-driven resolver per configured bootstrap endpoint.
    fn connect_to_bootstrap_peers(self: &Arc<Self>) {
        for endpoint in self.cfg.bootstrap_peers.clone() {
            tracing::info!(endpoint = %endpoint, "connecting to bootstrap peer");
            let member = NetworkMember::new(endpoint.clone(), PkiId([0u8; 32]));
            let comm = self.comm.clone();
            let resolver: PkiResolver = Arc::new(move || {
                let comm = comm.clone();
                let endpoint = endpoint.clone();
                Box::pin(async move {
                    let (pki_id, _identity) = comm
                        .handshake(&NetworkMember::new(endpoint, PkiId([0u8; 32])))
                        .await
                        .map_err(|e| GossipError::Transport(e.to_string()))?;
                    Ok(pki_id)
                })
            });
            self.disc.connect(member, resolver);
        }
    }

    // ==================== Inbound routing ====================

    async fn handle_message(&self, m: ReceivedMessage) {
        if self.stopping() {
            return;
        }
        if let Err(e) = m.msg.is_tag_legal() {
            tracing::warn!(peer = %m.info.pki_id, error = %e, "message with illegal tag dropped");
            return;
        }

        let msg = &m.msg.message;
        tracing::trace!(peer = %m.info.pki_id, kind = msg.content_kind(), "handling message");

        if msg.is_chain_state_msg() {
            self.handle_chain_state(&m);
            return;
        }

        if msg.is_channel_restricted() {
            let Some(mac) = msg.chain_mac() else {
                tracing::debug!("channel-restricted message without a MAC dropped");
                return;
            };
            match self.channels.lookup_by_mac(&mac) {
                Some(channel) => channel.handle_message(&m),
                None => tracing::debug!(mac = %mac, "message for unknown channel dropped"),
            }
            return;
        }

        if msg.is_discovery_msg() {
            if let Some(req) = msg.mem_req() {
                if !membership_request_matches_sender(req, &m.info.pki_id) {
                    tracing::warn!(
                        peer = %m.info.pki_id,
                        "membership request self information does not match the handshake"
                    );
                    return;
                }
            }
            if self.disc_inbound_tx.send(m).await.is_err() {
                tracing::debug!("discovery inbound queue closed");
            }
            return;
        }

        tracing::debug!(kind = msg.content_kind(), "unhandled message dropped");
    }

    /// Chain states are re-gossiped (excluding the sender), deduplicated,
    /// and delivered to their channel. A node listed in the member set of
    /// a state for a channel it hasn't joined yet joins as a follower.
    fn handle_chain_state(&self, m: &ReceivedMessage) {
        let sender = m.info.pki_id;
        self.emitter.add(EmittedMessage::new(
            m.msg.clone(),
            Arc::new(move |pki| *pki != sender),
            self.cfg.propagate_iterations,
        ));

        if !self.chain_state_store.add(m.msg.clone()) {
            tracing::trace!(peer = %sender, "stale chain state dropped");
            return;
        }

        let Some(mac) = m.msg.message.chain_mac() else { return };
        let mut channel = self.channels.lookup_by_mac(&mac);
        if channel.is_none() && self.declared_member(&m.msg.message) {
            let chain_id = String::from_utf8_lossy(&m.msg.message.channel).to_string();
            channel = Some(self.channels.join_channel(&chain_id, false));
        }
        if let Some(channel) = channel {
            channel.handle_message(m);
        }
    }

    /// Whether this node appears in the member list a chain state declares.
    fn declared_member(&self, msg: &RkSyncMessage) -> bool {
        let Some(state) = msg.chain_state() else { return false };
        match state.chain_state_info() {
            Ok(info) => info
                .members
                .iter()
                .any(|member| member == self.self_pki_id.as_bytes()),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable chain state info");
                false
            }
        }
    }

    // ==================== Outbound batches ====================

    /// Ship one emitter burst: chain states to channel members, alive
    /// messages to the open membership, everything filter-constrained.
    async fn gossip_batch(&self, batch: Vec<EmittedMessage>) {
        let membership = self.disc.membership();
        if membership.is_empty() {
            return;
        }

        for emitted in batch {
            let msg_filter = emitted.filter.clone();
            let mut selector: RoutingFilter =
                Arc::new(move |member: &NetworkMember| msg_filter(&member.pki_id));

            if emitted.msg.message.is_chain_state_msg() {
                if let Some(mac) = emitted.msg.message.chain_mac() {
                    if let Some(channel) = self.channels.lookup_by_mac(&mac) {
                        selector = combine(
                            selector,
                            Arc::new(move |member: &NetworkMember| {
                                channel.is_member(&member.pki_id)
                            }),
                        );
                    }
                }
            } else if !emitted.msg.message.is_alive_msg() {
                tracing::warn!(
                    kind = emitted.msg.message.content_kind(),
                    "unexpected message kind on the emitter"
                );
                continue;
            }

            let peers = select_peers(self.cfg.propagate_peer_num, &membership, &selector);
            if peers.is_empty() {
                continue;
            }
            self.comm.send(&emitted.msg, &peers).await;
        }
    }
}

/// Self-information in a membership request must carry the same PKI-id the
/// transport handshake authenticated.
fn membership_request_matches_sender(req: &MembershipRequest, sender: &PkiId) -> bool {
    let Some(self_info) = req.self_information.as_ref() else {
        return false;
    };
    let Ok(signed) = self_info.to_signed_message() else {
        return false;
    };
    let Some(alive) = signed.message.alive() else {
        return false;
    };
    alive
        .membership
        .as_ref()
        .is_some_and(|member| member.pki_id == sender.as_bytes())
}

/// Default disclosure policy: reveal alive messages only between peers
/// that both expose endpoints; envelopes are cloned intact.
fn default_disclosure_policy() -> DisclosurePolicy {
    Arc::new(|remote: &NetworkMember| {
        let remote_has_endpoint = remote.has_endpoint();
        let sieve: Sieve = Arc::new(move |msg: &SignedMessage| {
            let alive = msg
                .message
                .alive()
                .expect("disclosure policy applied to a non-alive message");
            let local_has_endpoint = alive
                .membership
                .as_ref()
                .is_some_and(|member| !member.endpoint.is_empty());
            local_has_endpoint && remote_has_endpoint
        });
        let envelope_filter: EnvelopeFilter =
            Arc::new(|msg: &SignedMessage| msg.envelope.clone());
        (sieve, envelope_filter)
    })
}

// ==================== Adapters ====================

/// Comm abilities handed to discovery.
struct DiscoveryAdapter<T: Transport> {
    comm: Arc<Comm<T>>,
    emitter: Arc<BatchingEmitter>,
    policy: DisclosurePolicy,
    propagate_iterations: usize,
}

#[async_trait::async_trait]
impl<T: Transport> DiscoveryComm for DiscoveryAdapter<T> {
    fn gossip(&self, msg: SignedMessage) {
        if self.propagate_iterations == 0 {
            return;
        }
        self.emitter.add(EmittedMessage::new(
            msg,
            Arc::new(|_| true),
            self.propagate_iterations,
        ));
    }

    fn forward(&self, msg: &ReceivedMessage) {
        if self.propagate_iterations == 0 {
            return;
        }
        let sender = msg.info.pki_id;
        self.emitter.add(EmittedMessage::new(
            msg.msg.clone(),
            Arc::new(move |pki| *pki != sender),
            self.propagate_iterations,
        ));
    }

    async fn send_to_peer(&self, peer: &NetworkMember, msg: SignedMessage) {
        // membership requests disclose our own alive message; the policy
        // decides what the remote peer gets to see of it
        if let Some(req) = msg.message.mem_req() {
            if let Some(self_env) = &req.self_information {
                if let Ok(self_signed) = self_env.to_signed_message() {
                    let (_sieve, envelope_filter) = (self.policy)(peer);
                    let mut rewrapped = msg.message.clone();
                    rewrapped.content = Some(Content::MemReq(MembershipRequest {
                        self_information: Some(envelope_filter(&self_signed)),
                        known: req.known.clone(),
                    }));
                    let rewrapped = SignedMessage::noop_sign(rewrapped);
                    self.comm.send(&rewrapped, std::slice::from_ref(peer)).await;
                    return;
                }
            }
        }
        self.comm.send(&msg, std::slice::from_ref(peer)).await;
    }

    async fn ping(&self, peer: &NetworkMember) -> bool {
        self.comm.probe(peer).await.is_ok()
    }

    fn close_conn(&self, peer: &NetworkMember) {
        self.comm.close_conn(&peer.pki_id);
    }
}

/// Crypto abilities handed to discovery.
struct SecurityAdapter {
    id_mapper: Arc<IdentityMapper>,
    include_identity_until: Instant,
}

impl DiscoverySecurity for SecurityAdapter {
    fn validate_alive_msg(&self, msg: &SignedMessage) -> bool {
        let Some(alive) = msg.message.alive() else {
            tracing::warn!("alive validation on a non-alive message");
            return false;
        };
        let Some(pki) = alive
            .membership
            .as_ref()
            .and_then(|member| PkiId::from_slice(&member.pki_id))
        else {
            tracing::warn!("alive message without a PKI-id");
            return false;
        };
        if !msg.is_signed() {
            tracing::warn!(peer = %pki, "unsigned alive message");
            return false;
        }

        if !alive.identity.is_empty() {
            // learn the identity the sender published during its warm-up
            if let Err(e) = self.id_mapper.put(pki, alive.identity.clone()) {
                tracing::debug!(peer = %pki, error = %e, "alive identity rejected");
                return false;
            }
        } else if self.id_mapper.get(&pki).is_err() {
            tracing::debug!(peer = %pki, "no identity known for alive message sender");
            return false;
        }

        let mapper = &self.id_mapper;
        msg.verify(&pki, &|pki_id, payload, signature| {
            mapper
                .verify(pki_id, signature, payload)
                .map_err(|e| ProtoError::Signing(e.to_string()))
        })
        .map_err(|e| tracing::warn!(peer = %pki, error = %e, "alive signature invalid"))
        .is_ok()
    }

    fn sign_message(&self, mut msg: RkSyncMessage) -> Option<SignedMessage> {
        if Instant::now() < self.include_identity_until {
            if let Some(Content::AliveMsg(alive)) = &mut msg.content {
                alive.identity = self.id_mapper.self_identity();
            }
        }
        let mapper = &self.id_mapper;
        SignedMessage::sign(msg, &|payload| Ok(mapper.sign(payload)))
            .map_err(|e| tracing::warn!(error = %e, "failed signing message"))
            .ok()
    }
}

/// Service-side abilities handed to channels.
struct ChanAdapter<T: Transport> {
    comm: Arc<Comm<T>>,
    emitter: Arc<BatchingEmitter>,
    disc: Arc<Discovery>,
    id_mapper: Arc<IdentityMapper>,
    fs: Arc<dyn FileSystem>,
}

#[async_trait::async_trait]
impl<T: Transport> ChannelAdapter for ChanAdapter<T> {
    fn self_pki_id(&self) -> PkiId {
        self.id_mapper.self_pki_id()
    }

    fn sign_message(&self, msg: RkSyncMessage) -> Result<SignedMessage, GossipError> {
        let mapper = &self.id_mapper;
        SignedMessage::sign(msg, &|payload| Ok(mapper.sign(payload)))
            .map_err(|e| GossipError::SignatureInvalid(e.to_string()))
    }

    fn verify(&self, pki_id: &PkiId, signature: &[u8], message: &[u8]) -> Result<(), GossipError> {
        self.id_mapper.verify(pki_id, signature, message)
    }

    fn gossip(&self, msg: EmittedMessage) {
        self.emitter.add(msg);
    }

    async fn send_to_member(&self, pki_id: &PkiId, msg: SignedMessage) {
        match self.disc.lookup(pki_id) {
            Some(member) if member.has_endpoint() => {
                self.comm.send(&msg, std::slice::from_ref(&member)).await;
            }
            _ => tracing::debug!(peer = %pki_id, "channel member not resolvable, send skipped"),
        }
    }

    fn filesystem(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }
}
