//! ChannelTransport, the in-memory Transport implementation
//!
//! One `DuplexStream` per connection: the dialer creates the pair, keeps
//! one end and hands the other to the acceptor's queue via the broker.

use skein_net::transport::{BiStream, Connection, Transport, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;
const ACCEPT_QUEUE_DEPTH: usize = 64;

/// Shared network broker routing dials between ChannelTransport instances.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::Sender<ChannelConnection>>>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, endpoint: String, accept_tx: mpsc::Sender<ChannelConnection>) {
        self.peers.lock().await.insert(endpoint, accept_tx);
    }

    /// Remove an endpoint so further dials fail, simulating a crash.
    pub async fn disconnect(&self, endpoint: &str) {
        self.peers.lock().await.remove(endpoint);
    }
}

impl fmt::Debug for ChannelNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelNetwork").finish()
    }
}

/// In-memory Transport bound to one endpoint name.
pub struct ChannelTransport {
    endpoint: String,
    network: ChannelNetwork,
    accept_rx: Mutex<mpsc::Receiver<ChannelConnection>>,
}

impl ChannelTransport {
    pub async fn new(endpoint: impl Into<String>, network: &ChannelNetwork) -> Self {
        let endpoint = endpoint.into();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        network.register(endpoint.clone(), accept_tx).await;
        Self {
            endpoint,
            network: network.clone(),
            accept_rx: Mutex::new(accept_rx),
        }
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Transport for ChannelTransport {
    type Connection = ChannelConnection;

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl std::future::Future<Output = Result<Self::Connection, TransportError>> + Send {
        let network = self.network.clone();
        let my_endpoint = self.endpoint.clone();
        let peer_endpoint = endpoint.to_string();

        async move {
            let accept_tx = {
                let peers = network.peers.lock().await;
                peers
                    .get(&peer_endpoint)
                    .cloned()
                    .ok_or_else(|| {
                        TransportError::Connect(format!("endpoint {peer_endpoint} not in network"))
                    })?
            };

            let (mine, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);

            let peer_conn = ChannelConnection {
                remote_endpoint: my_endpoint,
                stream: Mutex::new(Some(theirs)),
            };
            accept_tx.send(peer_conn).await.map_err(|_| {
                TransportError::Connect(format!("endpoint {peer_endpoint} stopped accepting"))
            })?;

            Ok(ChannelConnection {
                remote_endpoint: peer_endpoint,
                stream: Mutex::new(Some(mine)),
            })
        }
    }

    fn accept(&self) -> impl std::future::Future<Output = Option<Self::Connection>> + Send {
        async move { self.accept_rx.lock().await.recv().await }
    }
}

/// One side of an in-memory connection.
pub struct ChannelConnection {
    remote_endpoint: String,
    stream: Mutex<Option<DuplexStream>>,
}

impl Connection for ChannelConnection {
    type Stream = ChannelBiStream;

    fn open_bi(
        &self,
    ) -> impl std::future::Future<Output = Result<Self::Stream, TransportError>> + Send {
        async move {
            let stream = self.stream.lock().await.take().ok_or_else(|| {
                TransportError::Stream("connection stream already taken".into())
            })?;
            Ok(ChannelBiStream(stream))
        }
    }

    fn remote_endpoint(&self) -> String {
        self.remote_endpoint.clone()
    }
}

/// In-memory bidirectional stream backed by one end of a duplex pair.
pub struct ChannelBiStream(DuplexStream);

impl BiStream for ChannelBiStream {
    type SendStream = WriteHalf<DuplexStream>;
    type RecvStream = ReadHalf<DuplexStream>;

    fn into_split(self) -> (Self::SendStream, Self::RecvStream) {
        let (read, write) = tokio::io::split(self.0);
        (write, read)
    }
}
