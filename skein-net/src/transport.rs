//! Transport abstraction
//!
//! Decouples the comm layer from any concrete network stack. Production
//! deployments wrap their QUIC/TLS endpoint in these traits; tests use the
//! in-memory `skein-net-sim` implementation. Connections are addressed by
//! endpoint string because bootstrap happens before any PKI-id is known.

use std::fmt;
use std::future::Future;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("accept failed: {0}")]
    Accept(String),

    #[error("stream error: {0}")]
    Stream(String),
}

/// A bidirectional byte stream.
///
/// Both halves must be independently usable so reader and writer tasks can
/// own them separately.
pub trait BiStream: Send + 'static {
    type SendStream: tokio::io::AsyncWrite + Send + Unpin;
    type RecvStream: tokio::io::AsyncRead + Send + Unpin;

    fn into_split(self) -> (Self::SendStream, Self::RecvStream);
}

/// A connection to a remote peer that can open bidirectional streams.
pub trait Connection: Send + Sync + 'static {
    type Stream: BiStream;

    /// Open (dialer) or receive (acceptor) the connection's stream.
    fn open_bi(&self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Endpoint of the remote side, as far as the transport knows it.
    fn remote_endpoint(&self) -> String;
}

/// The transport seam.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    type Connection: Connection;

    /// Endpoint this transport listens on.
    fn endpoint(&self) -> String;

    /// Dial a remote endpoint.
    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Accept an inbound connection; `None` once the transport shuts down.
    fn accept(&self) -> impl Future<Output = Option<Self::Connection>> + Send;
}
