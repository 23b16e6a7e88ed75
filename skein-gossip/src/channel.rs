//! Channel state
//!
//! A channel is a named group of members sharing a file-synchronization
//! manifest, governed by the leader that created it. The leader publishes
//! monotonically versioned, signed chain states; members reconcile by
//! gossip plus periodic pulls from other members.
//!
//! Leadership is fixed at creation: there is no re-election, and mutation
//! attempts on a follower fail with `NotLeader`.

use crate::emitter::EmittedMessage;
use skein_model::{crypto, ChainMac, FileSystem, GossipConfig, GossipError, PkiId};
use skein_net::comm::ReceivedMessage;
use skein_proto::{
    ChainState, ChainStateInfo, ChainStatePullRequest, ChainStatePullResponse, Content,
    RkSyncMessage, SignedMessage, Tag,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Abilities a channel needs from the service, kept deliberately small so
/// channels carry no back-reference to the orchestrator.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync + 'static {
    fn self_pki_id(&self) -> PkiId;

    /// Sign a self message with the node's key.
    fn sign_message(&self, msg: RkSyncMessage) -> Result<SignedMessage, GossipError>;

    /// Verify a signature claimed by `pki_id`.
    fn verify(&self, pki_id: &PkiId, signature: &[u8], message: &[u8]) -> Result<(), GossipError>;

    /// Queue a message on the gossip emitter.
    fn gossip(&self, msg: EmittedMessage);

    /// Direct send to a channel member, resolved through discovery.
    async fn send_to_member(&self, pki_id: &PkiId, msg: SignedMessage);

    /// The filesystem channel manifests are materialized on.
    fn filesystem(&self) -> Arc<dyn FileSystem>;
}

/// Channel timing knobs, extracted from the gossip config.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub pull_interval: Duration,
    pub pull_peer_num: usize,
    pub publish_state_info_interval: Duration,
    pub propagate_iterations: usize,
}

impl From<&GossipConfig> for ChannelConfig {
    fn from(cfg: &GossipConfig) -> Self {
        Self {
            pull_interval: cfg.pull_interval,
            pull_peer_num: cfg.pull_peer_num,
            publish_state_info_interval: cfg.publish_state_info_interval,
            propagate_iterations: cfg.propagate_iterations,
        }
    }
}

struct AdoptedState {
    outer: SignedMessage,
    chain_state: ChainState,
    leader: PkiId,
    members: HashSet<PkiId>,
    files: Vec<skein_model::FileSyncInfo>,
    seq: u64,
}

struct Inner {
    mac: Option<ChainMac>,
    state: Option<AdoptedState>,
}

/// One joined channel.
pub struct GossipChannel {
    chain_id: String,
    is_leader: bool,
    adapter: Arc<dyn ChannelAdapter>,
    cfg: ChannelConfig,
    inner: Mutex<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipChannel {
    fn new(
        chain_id: String,
        as_leader: bool,
        adapter: Arc<dyn ChannelAdapter>,
        cfg: ChannelConfig,
    ) -> Arc<Self> {
        let mac = as_leader.then(|| crypto::chain_mac(&adapter.self_pki_id(), &chain_id));
        Arc::new(Self {
            chain_id,
            is_leader: as_leader,
            adapter,
            cfg,
            inner: Mutex::new(Inner { mac, state: None }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut handles = self.tasks.lock().expect("channel tasks poisoned");

        // pull reconciliation, staggered so channels don't fire in lockstep
        let chan = self.clone();
        let mut pull_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let stagger = chan.cfg.pull_interval.mul_f64(rand::random::<f64>());
            tokio::select! {
                _ = async { let _ = pull_shutdown.wait_for(|s| *s).await; } => return,
                _ = tokio::time::sleep(stagger) => {}
            }
            let mut ticker = tokio::time::interval(chan.cfg.pull_interval);
            loop {
                tokio::select! {
                    _ = async { let _ = pull_shutdown.wait_for(|s| *s).await; } => break,
                    _ = ticker.tick() => chan.pull_round().await,
                }
            }
        }));

        if self.is_leader {
            let chan = self.clone();
            let mut publish_shutdown = shutdown;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(chan.cfg.publish_state_info_interval);
                loop {
                    tokio::select! {
                        _ = async { let _ = publish_shutdown.wait_for(|s| *s).await; } => break,
                        _ = ticker.tick() => chan.publish_current_state(),
                    }
                }
            }));
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// The channel's MAC, once known (immediately for the leader, from the
    /// first adopted state for a follower).
    pub fn chain_mac(&self) -> Option<ChainMac> {
        self.inner.lock().expect("channel state poisoned").mac
    }

    /// The current chain state, if any.
    pub fn self_chain_state(&self) -> Option<ChainState> {
        let inner = self.inner.lock().expect("channel state poisoned");
        inner.state.as_ref().map(|s| s.chain_state.clone())
    }

    /// The channel's leader, once a state has been adopted.
    pub fn leader(&self) -> Option<PkiId> {
        let inner = self.inner.lock().expect("channel state poisoned");
        inner.state.as_ref().map(|s| s.leader)
    }

    /// Whether the peer belongs to this channel's member set.
    pub fn is_member(&self, pki_id: &PkiId) -> bool {
        let inner = self.inner.lock().expect("channel state poisoned");
        inner
            .state
            .as_ref()
            .is_some_and(|s| s.members.contains(pki_id))
    }

    /// Leader bootstrap: declare the initial member set and manifest,
    /// producing the seq-1 chain state and publishing it.
    pub fn initialize(
        &self,
        members: Vec<PkiId>,
        files: Vec<skein_model::FileSyncInfo>,
    ) -> Result<ChainState, GossipError> {
        if !self.is_leader {
            return Err(GossipError::NotLeader);
        }
        let mut member_set: HashSet<PkiId> = members.into_iter().collect();
        member_set.insert(self.adapter.self_pki_id());
        self.publish_new_state(1, member_set, files)
    }

    /// Leader mutation: add a member, bump the sequence, re-sign, publish.
    pub fn add_member(&self, member: PkiId) -> Result<ChainState, GossipError> {
        if !self.is_leader {
            return Err(GossipError::NotLeader);
        }
        let (seq, mut members, files) = self.current_for_mutation()?;
        members.insert(member);
        self.publish_new_state(seq + 1, members, files)
    }

    /// Leader mutation: add a manifest file.
    pub fn add_file(&self, file: skein_model::FileSyncInfo) -> Result<ChainState, GossipError> {
        if !self.is_leader {
            return Err(GossipError::NotLeader);
        }
        let (seq, members, mut files) = self.current_for_mutation()?;
        if files.iter().any(|existing| existing.path == file.path) {
            return Err(GossipError::InvalidInput(format!(
                "file {} already in channel {}",
                file.path, self.chain_id
            )));
        }
        files.push(file);
        self.publish_new_state(seq + 1, members, files)
    }

    /// Adopt an externally produced chain state after full verification.
    /// Followers additionally require themselves in the member set.
    pub fn initialize_with_chain_state(&self, state: ChainState) -> Result<(), GossipError> {
        let outer = self.wrap_state_message(state.clone());
        self.adopt(state, SignedMessage::noop_sign(outer))
    }

    /// Dispatch a channel-restricted inbound message.
    pub fn handle_message(&self, m: &ReceivedMessage) {
        match &m.msg.message.content {
            Some(Content::State(state)) => {
                if let Err(e) = self.adopt(state.clone(), m.msg.clone()) {
                    tracing::debug!(channel = %self.chain_id, error = %e, "chain state not adopted");
                }
            }
            Some(Content::StatePullRequest(_)) => self.handle_pull_request(m),
            Some(Content::StatePullResponse(res)) => self.handle_pull_response(res),
            _ => {
                // data-sync payloads are an extension point handled outside
                // this engine; see GossipService::accept
                tracing::debug!(
                    channel = %self.chain_id,
                    kind = m.msg.message.content_kind(),
                    "unhandled channel message dropped"
                );
            }
        }
    }

    /// Stop the channel's loops.
    pub fn stop(&self) {
        let tasks = {
            let mut guard = self.tasks.lock().expect("channel tasks poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
    }

    fn current_for_mutation(
        &self,
    ) -> Result<(u64, HashSet<PkiId>, Vec<skein_model::FileSyncInfo>), GossipError> {
        let inner = self.inner.lock().expect("channel state poisoned");
        let state = inner.state.as_ref().ok_or_else(|| {
            GossipError::InvalidInput(format!("channel {} is not initialized", self.chain_id))
        })?;
        Ok((state.seq, state.members.clone(), state.files.clone()))
    }

    /// Build, sign, store and publish a new state as the leader.
    fn publish_new_state(
        &self,
        seq: u64,
        members: HashSet<PkiId>,
        files: Vec<skein_model::FileSyncInfo>,
    ) -> Result<ChainState, GossipError> {
        let self_pki = self.adapter.self_pki_id();
        let mac = crypto::chain_mac(&self_pki, &self.chain_id);

        let info = ChainStateInfo {
            leader: self_pki.as_bytes().to_vec(),
            members: members.iter().map(|m| m.as_bytes().to_vec()).collect(),
            files: files.iter().cloned().map(Into::into).collect(),
        };
        // the sequence rides in the signed payload's nonce so it cannot be
        // tampered with independently of the state
        let inner_msg = RkSyncMessage {
            nonce: seq,
            channel: self.chain_id.as_bytes().to_vec(),
            tag: Tag::ChanOnly as i32,
            content: Some(Content::StateInfo(info)),
        };
        let signed_info = self.adapter.sign_message(inner_msg)?;

        let chain_state = ChainState {
            seq_num: seq,
            chain_mac: mac.as_bytes().to_vec(),
            envelope: Some(signed_info.envelope.clone()),
        };
        let outer = self
            .adapter
            .sign_message(self.wrap_state_message(chain_state.clone()))?;

        self.adopt(chain_state.clone(), outer)?;
        // push the new state out right away; the periodic republish only
        // covers late joiners
        self.publish_current_state();
        Ok(chain_state)
    }

    fn wrap_state_message(&self, state: ChainState) -> RkSyncMessage {
        RkSyncMessage {
            nonce: rand::random(),
            channel: self.chain_id.as_bytes().to_vec(),
            tag: Tag::ChanOnly as i32,
            content: Some(Content::State(state)),
        }
    }

    /// Verify and adopt a chain state; the single write path for channel
    /// state. Rejects MAC mismatches, bad signatures, foreign member sets
    /// and stale sequence numbers.
    fn adopt(&self, state: ChainState, outer: SignedMessage) -> Result<(), GossipError> {
        let mac = ChainMac::from_slice(&state.chain_mac)
            .ok_or_else(|| GossipError::InvalidInput("malformed chain MAC".into()))?;

        let envelope = state
            .envelope
            .clone()
            .ok_or_else(|| GossipError::InvalidInput("chain state without envelope".into()))?;
        let signed_info = envelope
            .to_signed_message()
            .map_err(|e| GossipError::InvalidInput(e.to_string()))?;
        let Some(Content::StateInfo(info)) = &signed_info.message.content else {
            return Err(GossipError::InvalidInput(
                "chain state envelope does not carry state info".into(),
            ));
        };

        let leader = PkiId::from_slice(&info.leader)
            .ok_or_else(|| GossipError::InvalidInput("malformed leader PKI-id".into()))?;

        // the MAC must re-derive from the declared leader and our chain id
        let expected = crypto::chain_mac(&leader, &self.chain_id);
        if mac != expected {
            return Err(GossipError::InvalidInput(format!(
                "chain MAC mismatch for channel {}: expected {expected}, got {mac}",
                self.chain_id
            )));
        }

        // the leader's signature covers the state info payload
        self.adapter
            .verify(&leader, &envelope.signature, &envelope.payload)?;

        // the signed payload pins the sequence number
        if signed_info.message.nonce != state.seq_num {
            return Err(GossipError::InvalidInput(
                "chain state sequence does not match its signed payload".into(),
            ));
        }

        let members: HashSet<PkiId> = info
            .members
            .iter()
            .filter_map(|m| PkiId::from_slice(m))
            .collect();
        let self_pki = self.adapter.self_pki_id();
        if !members.contains(&self_pki) {
            return Err(GossipError::InvalidInput(format!(
                "local peer is not a member of channel {}",
                self.chain_id
            )));
        }

        let files: Vec<skein_model::FileSyncInfo> =
            info.files.iter().cloned().map(Into::into).collect();

        {
            let mut inner = self.inner.lock().expect("channel state poisoned");
            if let Some(known_mac) = inner.mac {
                if known_mac != mac {
                    return Err(GossipError::InvalidInput(format!(
                        "chain MAC {mac} does not match channel {}",
                        self.chain_id
                    )));
                }
            }
            if let Some(current) = &inner.state {
                if state.seq_num <= current.seq {
                    return Err(GossipError::Stale(format!(
                        "chain state seq {} <= current {}",
                        state.seq_num, current.seq
                    )));
                }
            }
            inner.mac = Some(mac);
            inner.state = Some(AdoptedState {
                outer,
                chain_state: state.clone(),
                leader,
                members,
                files: files.clone(),
                seq: state.seq_num,
            });
        }
        tracing::info!(channel = %self.chain_id, seq = state.seq_num, "chain state adopted");

        self.ensure_files(&files);
        Ok(())
    }

    /// Create manifest files that don't exist locally yet.
    fn ensure_files(&self, files: &[skein_model::FileSyncInfo]) {
        let fs = self.adapter.filesystem();
        for file in files {
            if fs.stat(&self.chain_id, &file.path).is_ok() {
                continue;
            }
            if let Err(e) = fs.create(&self.chain_id, &file.path) {
                tracing::warn!(
                    channel = %self.chain_id,
                    path = %file.path,
                    error = %e,
                    "failed creating manifest file"
                );
            }
        }
    }

    /// Leader republish: keep the latest state riding the emitter so late
    /// joiners catch up without waiting for a pull round.
    fn publish_current_state(&self) {
        let (outer, members) = {
            let inner = self.inner.lock().expect("channel state poisoned");
            let Some(state) = &inner.state else { return };
            (state.outer.clone(), state.members.clone())
        };
        self.adapter.gossip(EmittedMessage::new(
            outer,
            Arc::new(move |pki| members.contains(pki)),
            self.cfg.propagate_iterations,
        ));
    }

    /// One pull round: ask random fellow members for their current state.
    async fn pull_round(&self) {
        let (mac, candidates) = {
            let inner = self.inner.lock().expect("channel state poisoned");
            let Some(mac) = inner.mac else { return };
            let self_pki = self.adapter.self_pki_id();
            let candidates: Vec<PkiId> = inner
                .state
                .as_ref()
                .map(|s| s.members.iter().copied().filter(|m| *m != self_pki).collect())
                .unwrap_or_default();
            (mac, candidates)
        };
        if candidates.is_empty() {
            return;
        }

        let request = RkSyncMessage {
            nonce: rand::random(),
            channel: self.chain_id.as_bytes().to_vec(),
            tag: Tag::ChanOnly as i32,
            content: Some(Content::StatePullRequest(ChainStatePullRequest {
                chain_mac: mac.as_bytes().to_vec(),
            })),
        };
        let signed = match self.adapter.sign_message(request) {
            Ok(signed) => signed,
            Err(e) => {
                tracing::warn!(channel = %self.chain_id, error = %e, "failed signing pull request");
                return;
            }
        };

        use rand::seq::SliceRandom;
        let mut picks = candidates;
        picks.shuffle(&mut rand::thread_rng());
        picks.truncate(self.cfg.pull_peer_num);

        for member in picks {
            tracing::trace!(channel = %self.chain_id, peer = %member, "state pull request");
            self.adapter.send_to_member(&member, signed.clone()).await;
        }
    }

    /// Serve our current state to a fellow member.
    fn handle_pull_request(&self, m: &ReceivedMessage) {
        if !self.is_member(&m.info.pki_id) {
            tracing::warn!(
                channel = %self.chain_id,
                peer = %m.info.pki_id,
                "pull request from non-member dropped"
            );
            return;
        }
        let (mac, outer) = {
            let inner = self.inner.lock().expect("channel state poisoned");
            let Some(mac) = inner.mac else { return };
            let Some(state) = &inner.state else { return };
            (mac, state.outer.clone())
        };
        let response = RkSyncMessage {
            nonce: m.msg.message.nonce,
            channel: self.chain_id.as_bytes().to_vec(),
            tag: Tag::ChanOnly as i32,
            content: Some(Content::StatePullResponse(ChainStatePullResponse {
                chain_mac: mac.as_bytes().to_vec(),
                element: Some(outer.envelope.clone()),
            })),
        };
        match self.adapter.sign_message(response) {
            Ok(signed) => m.respond(&signed),
            Err(e) => {
                tracing::warn!(channel = %self.chain_id, error = %e, "failed signing pull response")
            }
        }
    }

    /// Absorb a pulled state if it beats ours.
    fn handle_pull_response(&self, res: &ChainStatePullResponse) {
        let Some(element) = &res.element else { return };
        let signed = match element.to_signed_message() {
            Ok(signed) => signed,
            Err(e) => {
                tracing::warn!(channel = %self.chain_id, error = %e, "undecodable pull response");
                return;
            }
        };
        let Some(state) = signed.message.chain_state().cloned() else {
            tracing::warn!(channel = %self.chain_id, "pull response element is not a chain state");
            return;
        };
        if let Err(e) = self.adopt(state, signed) {
            tracing::debug!(channel = %self.chain_id, error = %e, "pulled state not adopted");
        }
    }
}

/// Registry of joined channels, keyed by chain id.
pub struct ChannelRegistry {
    adapter: Arc<dyn ChannelAdapter>,
    cfg: ChannelConfig,
    channels: Mutex<HashMap<String, Arc<GossipChannel>>>,
    shutdown: watch::Receiver<bool>,
}

impl ChannelRegistry {
    pub fn new(
        adapter: Arc<dyn ChannelAdapter>,
        cfg: ChannelConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            adapter,
            cfg,
            channels: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Create the per-channel state if absent; idempotent, and the leader
    /// flag only applies on creation.
    pub fn join_channel(&self, chain_id: &str, as_leader: bool) -> Arc<GossipChannel> {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        if let Some(existing) = channels.get(chain_id) {
            return existing.clone();
        }
        tracing::info!(channel = %chain_id, leader = as_leader, "joining channel");
        let channel = GossipChannel::new(
            chain_id.to_string(),
            as_leader,
            self.adapter.clone(),
            self.cfg.clone(),
        );
        channel.start(self.shutdown.clone());
        channels.insert(chain_id.to_string(), channel.clone());
        channel
    }

    pub fn get(&self, chain_id: &str) -> Option<Arc<GossipChannel>> {
        let channels = self.channels.lock().expect("channel registry poisoned");
        channels.get(chain_id).cloned()
    }

    /// Resolve the channel a message belongs to by its chain MAC.
    pub fn lookup_by_mac(&self, mac: &ChainMac) -> Option<Arc<GossipChannel>> {
        let channels = self.channels.lock().expect("channel registry poisoned");
        channels
            .values()
            .find(|chan| chan.chain_mac().as_ref() == Some(mac))
            .cloned()
    }

    /// Leave a channel: stop its loops and forget it.
    pub fn remove(&self, chain_id: &str) {
        let removed = {
            let mut channels = self.channels.lock().expect("channel registry poisoned");
            channels.remove(chain_id)
        };
        if let Some(channel) = removed {
            tracing::info!(channel = %chain_id, "closing channel");
            channel.stop();
        }
    }

    pub fn stop(&self) {
        let channels = {
            let mut guard = self.channels.lock().expect("channel registry poisoned");
            std::mem::take(&mut *guard)
        };
        for channel in channels.values() {
            channel.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::{DiskFileSystem, FileMode, FileSyncInfo, NodeIdentity};
    use std::sync::Mutex as StdMutex;

    struct TestAdapter {
        node: NodeIdentity,
        pki: PkiId,
        identity: Vec<u8>,
        peers: StdMutex<HashMap<PkiId, Vec<u8>>>,
        gossiped: StdMutex<Vec<EmittedMessage>>,
        sent: StdMutex<Vec<(PkiId, SignedMessage)>>,
        fs: Arc<dyn FileSystem>,
    }

    impl TestAdapter {
        fn new(dir: &std::path::Path) -> Arc<Self> {
            let node = NodeIdentity::generate();
            let identity = skein_proto::serialize_identity("leader", &node.public_key_bytes());
            let pki = skein_proto::pki_id_of(&identity).unwrap();
            let mut peers = HashMap::new();
            peers.insert(pki, identity.clone());
            Arc::new(Self {
                node,
                pki,
                identity,
                peers: StdMutex::new(peers),
                gossiped: StdMutex::new(Vec::new()),
                sent: StdMutex::new(Vec::new()),
                fs: Arc::new(DiskFileSystem::new(dir)),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChannelAdapter for TestAdapter {
        fn self_pki_id(&self) -> PkiId {
            self.pki
        }
        fn sign_message(&self, msg: RkSyncMessage) -> Result<SignedMessage, GossipError> {
            SignedMessage::sign(msg, &|payload| Ok(self.node.sign(payload)))
                .map_err(|e| GossipError::SignatureInvalid(e.to_string()))
        }
        fn verify(
            &self,
            pki_id: &PkiId,
            signature: &[u8],
            message: &[u8],
        ) -> Result<(), GossipError> {
            let peers = self.peers.lock().unwrap();
            let identity = peers
                .get(pki_id)
                .ok_or_else(|| GossipError::NotFound(format!("{pki_id}")))?;
            skein_proto::verify_with_identity(identity, message, signature)
                .map_err(|e| GossipError::SignatureInvalid(e.to_string()))
        }
        fn gossip(&self, msg: EmittedMessage) {
            self.gossiped.lock().unwrap().push(msg);
        }
        async fn send_to_member(&self, pki_id: &PkiId, msg: SignedMessage) {
            self.sent.lock().unwrap().push((*pki_id, msg));
        }
        fn filesystem(&self) -> Arc<dyn FileSystem> {
            self.fs.clone()
        }
    }

    fn registry(adapter: Arc<TestAdapter>) -> (ChannelRegistry, watch::Sender<bool>) {
        let cfg = ChannelConfig {
            pull_interval: Duration::from_secs(60),
            pull_peer_num: 3,
            publish_state_info_interval: Duration::from_secs(60),
            propagate_iterations: 1,
        };
        let (tx, rx) = watch::channel(false);
        (ChannelRegistry::new(adapter, cfg, rx), tx)
    }

    #[tokio::test]
    async fn leader_initializes_and_mutates_state() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter.clone());

        let chan = registry.join_channel("c1", true);
        let s1 = chan
            .initialize(vec![], vec![FileSyncInfo::new("f", FileMode::Append)])
            .expect("initialize");
        assert_eq!(s1.seq_num, 1);
        assert!(chan.is_member(&adapter.pki));
        assert!(dir.path().join("c1/f").exists());

        let other = PkiId([9u8; 32]);
        let s2 = chan.add_member(other).expect("add member");
        assert_eq!(s2.seq_num, 2);
        assert!(chan.is_member(&other));

        let s3 = chan
            .add_file(FileSyncInfo::new("g", FileMode::Random))
            .expect("add file");
        assert_eq!(s3.seq_num, 3);

        assert!(matches!(
            chan.add_file(FileSyncInfo::new("g", FileMode::Random)),
            Err(GossipError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn mutations_are_published_through_the_emitter() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter.clone());

        let chan = registry.join_channel("c1", true);
        chan.initialize(vec![], vec![]).expect("initialize");
        chan.add_member(PkiId([9u8; 32])).expect("add member");

        let gossiped = adapter.gossiped.lock().unwrap();
        assert_eq!(gossiped.len(), 2);
        assert!(gossiped
            .iter()
            .all(|emitted| emitted.msg.message.is_chain_state_msg()));
        // the recipient filter is the member set
        let filter = &gossiped[1].filter;
        assert!(filter(&adapter.pki));
        assert!(filter(&PkiId([9u8; 32])));
        assert!(!filter(&PkiId([8u8; 32])));
    }

    #[tokio::test]
    async fn pull_round_requests_and_serves_state() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter.clone());

        let chan = registry.join_channel("c1", true);
        chan.initialize(vec![PkiId([9u8; 32])], vec![])
            .expect("initialize");

        // the pull round targets the other member
        chan.pull_round().await;
        {
            let sent = adapter.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, PkiId([9u8; 32]));
            assert!(matches!(
                sent[0].1.message.content,
                Some(Content::StatePullRequest(_))
            ));
        }

        // a member's pull request is answered with the current state
        let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel(4);
        let request = adapter
            .sign_message(RkSyncMessage {
                nonce: 42,
                channel: b"c1".to_vec(),
                tag: Tag::ChanOnly as i32,
                content: Some(Content::StatePullRequest(ChainStatePullRequest {
                    chain_mac: chan.chain_mac().unwrap().as_bytes().to_vec(),
                })),
            })
            .expect("sign request");
        let info = Arc::new(skein_net::comm::ConnectionInfo {
            pki_id: PkiId([9u8; 32]),
            identity: vec![],
            endpoint: "ep-9".into(),
        });
        chan.handle_message(&ReceivedMessage::new(request.clone(), info.clone(), reply_tx));

        let envelope = reply_rx.try_recv().expect("pull response");
        let response = envelope.to_signed_message().expect("decode");
        assert_eq!(response.message.nonce, 42);
        let Some(Content::StatePullResponse(res)) = &response.message.content else {
            panic!("expected a pull response");
        };
        let served = res
            .element
            .as_ref()
            .unwrap()
            .to_signed_message()
            .expect("decode element");
        assert_eq!(served.message.chain_state().unwrap().seq_num, 1);

        // non-members get nothing
        let (stranger_tx, mut stranger_rx) = tokio::sync::mpsc::channel(4);
        let stranger = Arc::new(skein_net::comm::ConnectionInfo {
            pki_id: PkiId([7u8; 32]),
            identity: vec![],
            endpoint: "ep-7".into(),
        });
        chan.handle_message(&ReceivedMessage::new(request, stranger, stranger_tx));
        assert!(stranger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn followers_reject_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter);

        let chan = registry.join_channel("c1", false);
        assert!(matches!(
            chan.add_member(PkiId([1u8; 32])),
            Err(GossipError::NotLeader)
        ));
        assert!(matches!(
            chan.initialize(vec![], vec![]),
            Err(GossipError::NotLeader)
        ));
    }

    #[tokio::test]
    async fn join_channel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter);

        let first = registry.join_channel("c1", true);
        let second = registry.join_channel("c1", false);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.is_leader());
    }

    #[tokio::test]
    async fn stale_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter.clone());

        let chan = registry.join_channel("c1", true);
        let s1 = chan.initialize(vec![], vec![]).expect("initialize");
        let _s2 = chan.add_member(PkiId([9u8; 32])).expect("add member");

        // replaying the seq-1 state must not regress the channel
        assert!(matches!(
            chan.initialize_with_chain_state(s1),
            Err(GossipError::Stale(_))
        ));
        assert_eq!(chan.self_chain_state().unwrap().seq_num, 2);
    }

    #[tokio::test]
    async fn tampered_sequence_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new(dir.path());
        let (registry, _sd) = registry(adapter.clone());

        let chan = registry.join_channel("c1", true);
        let s1 = chan.initialize(vec![], vec![]).expect("initialize");

        // bump the unsigned outer seq without re-signing the payload
        let mut forged = s1;
        forged.seq_num = 99;
        assert!(matches!(
            chan.initialize_with_chain_state(forged),
            Err(GossipError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn foreign_leader_state_is_rejected() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let leader_adapter = TestAdapter::new(dir_a.path());
        let (leader_registry, _sd_a) = registry(leader_adapter.clone());

        // a state created by a foreign leader for the same chain id
        let foreign = leader_registry.join_channel("c1", true);
        let state = foreign.initialize(vec![], vec![]).expect("initialize");

        // the local node is not in the member set and the MAC re-derives
        // from a different leader
        let follower_adapter = TestAdapter::new(dir_b.path());
        {
            let mut peers = follower_adapter.peers.lock().unwrap();
            peers.insert(leader_adapter.pki, leader_adapter.identity.clone());
        }
        let (follower_registry, _sd_b) = registry(follower_adapter);
        let chan = follower_registry.join_channel("c1", false);
        assert!(matches!(
            chan.initialize_with_chain_state(state),
            Err(GossipError::InvalidInput(_))
        ));
    }
}
