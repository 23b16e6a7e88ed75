//! Envelope framing using tokio-util's LengthDelimitedCodec
//!
//! Length-prefixed `Envelope`s over any AsyncWrite/AsyncRead stream,
//! decoupled from the transport backend.

use crate::transport::TransportError;
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use skein_proto::Envelope;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Framed writer for sending envelopes over any AsyncWrite stream.
pub struct EnvelopeSink<W: AsyncWrite + Send + Unpin> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Send + Unpin> EnvelopeSink<W> {
    pub fn new(stream: W) -> Self {
        Self {
            inner: FramedWrite::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Send one length-prefixed envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode_to_vec();
        self.inner
            .send(bytes.into())
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

/// Framed reader for receiving envelopes from any AsyncRead stream.
pub struct EnvelopeStream<R: AsyncRead + Send + Unpin> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Send + Unpin> EnvelopeStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            inner: FramedRead::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Receive the next envelope, or `None` once the stream closes.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inner.next().await {
            Some(Ok(bytes)) => Envelope::decode(&bytes[..])
                .map(Some)
                .map_err(|e| TransportError::Stream(e.to_string())),
            Some(Err(e)) => Err(TransportError::Stream(e.to_string())),
            None => Ok(None),
        }
    }
}
