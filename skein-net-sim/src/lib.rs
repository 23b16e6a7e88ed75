//! In-memory Transport implementation
//!
//! `tokio::io::DuplexStream` bi-streams routed through a shared
//! `ChannelNetwork` broker keyed by endpoint string. Every integration
//! test in the workspace runs its cluster on this.

mod channel_transport;

pub use channel_transport::{ChannelConnection, ChannelNetwork, ChannelTransport};
