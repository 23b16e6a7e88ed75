//! skein networking
//!
//! The comm layer between the gossip engine and the wire:
//! - **transport**: the duplex-stream seam; production backends and the
//!   in-memory simulator both implement it
//! - **framing**: length-delimited `Envelope` framing over any byte stream
//! - **demux**: predicate-subscribed fan-out of received messages
//! - **comm**: connection cache, authenticated handshake, send/probe,
//!   presumed-dead reporting

pub mod comm;
pub mod demux;
pub mod framing;
pub mod transport;

pub use comm::{Comm, CommError, ConnectionInfo, HandshakeAuth, ReceivedMessage};
pub use demux::Demux;
pub use framing::{EnvelopeSink, EnvelopeStream};
pub use transport::{BiStream, Connection, Transport, TransportError};
