//! Comm server
//!
//! Owns the connection cache and the wire lifecycle of every stream:
//! authenticated ConnEstablish handshakes, per-peer bounded send queues,
//! the unauthenticated ping probe, and presumed-dead reporting when a peer
//! stops accepting traffic.

use crate::demux::Demux;
use crate::framing::{EnvelopeSink, EnvelopeStream};
use crate::transport::{BiStream, Connection, Transport, TransportError};
use skein_model::{CommConfig, NetworkMember, PeerIdentity, PkiId};
use skein_proto::{
    ConnEstablish, Content, Empty, Envelope, ProtoError, RkSyncMessage, SignedMessage, Tag,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const PRESUMED_DEAD_DEPTH: usize = 100;

/// Errors of the comm layer.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("peer has no endpoint to dial")]
    NoEndpoint,

    #[error("timed out waiting for the remote peer")]
    Timeout,

    #[error("handshake rejected: {0}")]
    Authentication(String),

    #[error("comm layer is stopped")]
    Stopped,
}

/// Authentication seam the comm layer uses during handshakes.
///
/// Implemented by the identity mapper: it derives PKI-ids, records remote
/// identities and produces/validates envelope signatures.
pub trait HandshakeAuth: Send + Sync + 'static {
    fn self_pki_id(&self) -> PkiId;

    fn self_identity(&self) -> PeerIdentity;

    /// Sign an envelope payload with the node's key.
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CommError>;

    /// Validate a remote ConnEstablish: the claimed PKI-id must match the
    /// presented identity, the signature must verify under it, and the
    /// identity is recorded for later message verification. A claim that
    /// conflicts with an already-recorded identity MUST fail, which closes
    /// the offending connection.
    fn authenticate(
        &self,
        claimed: &PkiId,
        identity: &[u8],
        payload: &[u8],
        signature: &[u8],
    ) -> Result<(), CommError>;
}

/// Who a message arrived from, established at handshake time.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub pki_id: PkiId,
    pub identity: PeerIdentity,
    pub endpoint: String,
}

/// An inbound message plus the authenticated connection it arrived on.
#[derive(Clone)]
pub struct ReceivedMessage {
    pub msg: SignedMessage,
    pub info: Arc<ConnectionInfo>,
    reply: mpsc::Sender<Envelope>,
}

impl ReceivedMessage {
    /// Assemble a received message. Normally only the comm layer does this;
    /// exposed so simulation harnesses can inject traffic.
    pub fn new(msg: SignedMessage, info: Arc<ConnectionInfo>, reply: mpsc::Sender<Envelope>) -> Self {
        Self { msg, info, reply }
    }

    /// Send a reply on the connection the message arrived on. Lossy under
    /// backpressure, like every other send.
    pub fn respond(&self, msg: &SignedMessage) {
        if self.reply.try_send(msg.envelope.clone()).is_err() {
            tracing::warn!(peer = %self.info.pki_id, "reply queue unavailable, dropping response");
        }
    }
}

struct ConnHandle {
    tx: mpsc::Sender<Envelope>,
}

/// The comm server. Generic over the transport seam.
pub struct Comm<T: Transport> {
    transport: Arc<T>,
    auth: Arc<dyn HandshakeAuth>,
    cfg: CommConfig,
    conns: Mutex<HashMap<PkiId, ConnHandle>>,
    demux: Arc<Demux<ReceivedMessage>>,
    presumed_dead_tx: mpsc::Sender<PkiId>,
    presumed_dead_rx: Mutex<Option<mpsc::Receiver<PkiId>>>,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Comm<T> {
    pub fn new(
        transport: Arc<T>,
        auth: Arc<dyn HandshakeAuth>,
        cfg: CommConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (presumed_dead_tx, presumed_dead_rx) = mpsc::channel(PRESUMED_DEAD_DEPTH);
        Arc::new(Self {
            transport,
            auth,
            cfg,
            conns: Mutex::new(HashMap::new()),
            demux: Arc::new(Demux::new()),
            presumed_dead_tx,
            presumed_dead_rx: Mutex::new(Some(presumed_dead_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the inbound accept loop.
    pub fn start(self: &Arc<Self>) {
        let comm = self.clone();
        let mut shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                    conn = comm.transport.accept() => {
                        let Some(conn) = conn else { break };
                        let conn_comm = comm.clone();
                        let task = tokio::spawn(async move {
                            if let Err(e) = conn_comm.serve_inbound(conn).await {
                                tracing::debug!(error = %e, "inbound connection ended");
                            }
                        });
                        comm.tasks.lock().expect("task list poisoned").push(task);
                    }
                }
            }
            tracing::debug!("accept loop exiting");
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Register an inbound subscriber; see [`Demux::add_channel`].
    pub fn accept(
        &self,
        predicate: Arc<dyn Fn(&ReceivedMessage) -> bool + Send + Sync>,
    ) -> mpsc::Receiver<ReceivedMessage> {
        self.demux.add_channel(predicate)
    }

    /// Take the presumed-dead receiver. Single consumer.
    pub fn take_presumed_dead(&self) -> Option<mpsc::Receiver<PkiId>> {
        self.presumed_dead_rx
            .lock()
            .expect("presumed-dead lock poisoned")
            .take()
    }

    /// Send a signed message to each peer, dialing where necessary.
    /// Transport failures never surface to the caller; they are reported on
    /// the presumed-dead channel instead.
    pub async fn send(self: &Arc<Self>, msg: &SignedMessage, peers: &[NetworkMember]) {
        let sends = peers.iter().map(|peer| {
            let comm = self.clone();
            let envelope = msg.envelope.clone();
            async move {
                match comm.ensure_connection(peer).await {
                    Ok(tx) => {
                        if tx.try_send(envelope).is_err() {
                            tracing::warn!(peer = %peer, "send queue full or closed, presuming dead");
                            comm.close_conn(&peer.pki_id);
                            comm.report_presumed_dead(peer.pki_id);
                        }
                    }
                    Err(CommError::NoEndpoint) => {
                        tracing::debug!(peer = %peer, "peer has no dialable endpoint, send skipped");
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "dial failed, presuming dead");
                        comm.report_presumed_dead(peer.pki_id);
                    }
                }
            }
        });
        futures_util::future::join_all(sends).await;
    }

    /// One-shot liveness probe: dial, send an Empty, await the echo.
    pub async fn probe(&self, member: &NetworkMember) -> Result<(), CommError> {
        if !member.has_endpoint() {
            return Err(CommError::NoEndpoint);
        }
        let conn = timeout(
            self.cfg.dial_timeout,
            self.transport.connect(&member.endpoint),
        )
        .await
        .map_err(|_| CommError::Timeout)??;
        let stream = conn.open_bi().await?;
        let (send_half, recv_half) = stream.into_split();
        let mut sink = EnvelopeSink::new(send_half);
        let mut stream = EnvelopeStream::new(recv_half);

        let ping = SignedMessage::noop_sign(empty_message());
        sink.send(&ping.envelope).await?;

        match timeout(self.cfg.handshake_timeout, stream.recv()).await {
            Ok(Ok(Some(_))) => Ok(()),
            Ok(Ok(None)) => Err(CommError::Transport(TransportError::Stream(
                "stream closed before probe reply".into(),
            ))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CommError::Timeout),
        }
    }

    /// Dial an endpoint and run the ConnEstablish exchange. Returns the
    /// authenticated remote identity; the connection stays cached.
    pub async fn handshake(
        self: &Arc<Self>,
        member: &NetworkMember,
    ) -> Result<(PkiId, PeerIdentity), CommError> {
        if !member.has_endpoint() {
            return Err(CommError::NoEndpoint);
        }
        let info = self.dial(&member.endpoint).await?;
        Ok((info.pki_id, info.identity.clone()))
    }

    /// Tear down any cached connection to the peer.
    pub fn close_conn(&self, pki_id: &PkiId) {
        let removed = self
            .conns
            .lock()
            .expect("conn cache poisoned")
            .remove(pki_id);
        if removed.is_some() {
            tracing::debug!(peer = %pki_id, "connection evicted");
        }
    }

    /// Drop every connection and subscriber, abort in-flight tasks.
    pub async fn stop(&self) {
        self.demux.close();
        self.conns.lock().expect("conn cache poisoned").clear();
        let tasks = {
            let mut guard = self.tasks.lock().expect("task list poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
    }

    fn report_presumed_dead(&self, pki_id: PkiId) {
        if self.presumed_dead_tx.try_send(pki_id).is_err() {
            tracing::debug!(peer = %pki_id, "presumed-dead queue full");
        }
    }

    /// Return the cached send queue for the peer, dialing if absent.
    async fn ensure_connection(
        self: &Arc<Self>,
        peer: &NetworkMember,
    ) -> Result<mpsc::Sender<Envelope>, CommError> {
        if let Some(handle) = self.conns.lock().expect("conn cache poisoned").get(&peer.pki_id) {
            return Ok(handle.tx.clone());
        }
        if !peer.has_endpoint() {
            return Err(CommError::NoEndpoint);
        }
        let info = self.dial(&peer.endpoint).await?;
        if info.pki_id != peer.pki_id {
            self.close_conn(&info.pki_id);
            return Err(CommError::Authentication(format!(
                "endpoint {} answered as {}, expected {}",
                peer.endpoint, info.pki_id, peer.pki_id
            )));
        }
        let guard = self.conns.lock().expect("conn cache poisoned");
        guard
            .get(&info.pki_id)
            .map(|handle| handle.tx.clone())
            .ok_or(CommError::Stopped)
    }

    /// Dial + handshake + register. Returns the authenticated peer info.
    async fn dial(self: &Arc<Self>, endpoint: &str) -> Result<Arc<ConnectionInfo>, CommError> {
        let conn = timeout(self.cfg.dial_timeout, self.transport.connect(endpoint))
            .await
            .map_err(|_| CommError::Timeout)??;
        let remote_endpoint = conn.remote_endpoint();
        let stream = conn.open_bi().await?;
        let (send_half, recv_half) = stream.into_split();
        let mut sink = EnvelopeSink::new(send_half);
        let mut stream = EnvelopeStream::new(recv_half);

        // dialer speaks first
        let hello = self.conn_establish()?;
        sink.send(&hello.envelope).await?;

        let envelope = match timeout(self.cfg.handshake_timeout, stream.recv()).await {
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => {
                return Err(CommError::Transport(TransportError::Stream(
                    "stream closed during handshake".into(),
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(CommError::Timeout),
        };
        let info = self.authenticate_conn_establish(&envelope, remote_endpoint)?;
        let info = Arc::new(info);
        self.register_connection(info.clone(), sink, stream);
        Ok(info)
    }

    async fn serve_inbound(
        self: &Arc<Self>,
        conn: T::Connection,
    ) -> Result<(), CommError> {
        let remote_endpoint = conn.remote_endpoint();
        let stream = conn.open_bi().await?;
        let (send_half, recv_half) = stream.into_split();
        let mut sink = EnvelopeSink::new(send_half);
        let mut stream = EnvelopeStream::new(recv_half);

        let envelope = match timeout(self.cfg.handshake_timeout, stream.recv()).await {
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(CommError::Timeout),
        };

        let first = envelope.to_signed_message()?;
        if matches!(first.message.content, Some(Content::Empty(_))) {
            // unauthenticated liveness probe: echo and hang up
            let pong = SignedMessage::noop_sign(empty_message());
            sink.send(&pong.envelope).await?;
            return Ok(());
        }

        let info = self.authenticate_conn_establish(&envelope, remote_endpoint)?;

        // acceptor answers with its own attestation
        let hello = self.conn_establish()?;
        sink.send(&hello.envelope).await?;

        self.register_connection(Arc::new(info), sink, stream);
        Ok(())
    }

    fn conn_establish(&self) -> Result<SignedMessage, CommError> {
        let msg = RkSyncMessage {
            nonce: 0,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::Conn(ConnEstablish {
                pki_id: self.auth.self_pki_id().as_bytes().to_vec(),
                identity: self.auth.self_identity(),
            })),
        };
        let auth = &self.auth;
        SignedMessage::sign(msg, &|payload| {
            auth.sign(payload)
                .map_err(|e| ProtoError::Signing(e.to_string()))
        })
        .map_err(CommError::from)
    }

    fn authenticate_conn_establish(
        &self,
        envelope: &Envelope,
        endpoint: String,
    ) -> Result<ConnectionInfo, CommError> {
        let signed = envelope.to_signed_message()?;
        let Some(conn) = signed.message.conn_establish() else {
            return Err(CommError::Authentication(
                "first message was not a ConnEstablish".into(),
            ));
        };
        let claimed = PkiId::from_slice(&conn.pki_id)
            .ok_or_else(|| CommError::Authentication("malformed PKI-id".into()))?;
        self.auth.authenticate(
            &claimed,
            &conn.identity,
            &envelope.payload,
            &envelope.signature,
        )?;
        Ok(ConnectionInfo {
            pki_id: claimed,
            identity: conn.identity.clone(),
            endpoint,
        })
    }

    fn register_connection<W, R>(
        self: &Arc<Self>,
        info: Arc<ConnectionInfo>,
        mut sink: EnvelopeSink<W>,
        mut stream: EnvelopeStream<R>,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.cfg.send_queue_depth);
        let pki_id = info.pki_id;

        {
            let mut conns = self.conns.lock().expect("conn cache poisoned");
            // a racing dial may have beaten us; the newest registration wins
            conns.insert(pki_id, ConnHandle { tx: tx.clone() });
        }
        tracing::debug!(peer = %pki_id, endpoint = %info.endpoint, "connection established");

        // writer: drain the per-peer queue onto the wire
        let writer_comm = self.clone();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = sink.send(&envelope).await {
                    tracing::debug!(peer = %pki_id, error = %e, "write failed, presuming dead");
                    writer_comm.close_conn(&pki_id);
                    writer_comm.report_presumed_dead(pki_id);
                    break;
                }
            }
        });

        // reader: decode, answer pings, demux the rest
        let reader_comm = self.clone();
        let reader_tx = tx;
        let reader = tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(Some(envelope)) => {
                        let signed = match envelope.to_signed_message() {
                            Ok(signed) => signed,
                            Err(e) => {
                                tracing::warn!(peer = %pki_id, error = %e, "undecodable envelope dropped");
                                continue;
                            }
                        };
                        match signed.message.content {
                            Some(Content::Empty(_)) => {
                                let pong = SignedMessage::noop_sign(empty_message());
                                let _ = reader_tx.try_send(pong.envelope);
                            }
                            Some(Content::Conn(_)) | None => {}
                            _ => reader_comm.demux.demux(ReceivedMessage {
                                msg: signed,
                                info: info.clone(),
                                reply: reader_tx.clone(),
                            }),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_comm.close_conn(&pki_id);
            tracing::debug!(peer = %pki_id, "connection reader exiting");
        });

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(writer);
        tasks.push(reader);
    }

    /// Endpoint the underlying transport listens on.
    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }
}

fn empty_message() -> RkSyncMessage {
    RkSyncMessage {
        nonce: 0,
        channel: vec![],
        tag: Tag::Empty as i32,
        content: Some(Content::Empty(Empty {})),
    }
}
