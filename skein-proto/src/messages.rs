//! Message definitions
//!
//! Framing on the wire is always an `Envelope` whose payload is an encoded
//! `RkSyncMessage`. The content oneof occupies tags 5–14; tags 1–3 carry
//! the routing header (nonce, channel, tag).

use prost::{Enumeration, Message, Oneof};

/// Signed wrapper framing every message on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// Routing scope of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum Tag {
    /// Discovery-plane message, not bound to any channel.
    Empty = 0,
    /// Channel-restricted message; the `channel` field must be set.
    ChanOnly = 1,
}

/// The top-level gossip message.
#[derive(Clone, PartialEq, Message)]
pub struct RkSyncMessage {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    /// Chain id for channel-restricted messages; empty otherwise.
    #[prost(bytes = "vec", tag = "2")]
    pub channel: Vec<u8>,
    #[prost(enumeration = "Tag", tag = "3")]
    pub tag: i32,
    #[prost(oneof = "Content", tags = "5, 6, 7, 8, 9, 10, 11, 12, 13, 14")]
    pub content: Option<Content>,
}

/// Content variants of `RkSyncMessage`.
#[derive(Clone, PartialEq, Oneof)]
pub enum Content {
    #[prost(message, tag = "5")]
    AliveMsg(AliveMessage),
    #[prost(message, tag = "6")]
    Empty(Empty),
    #[prost(message, tag = "7")]
    Conn(ConnEstablish),
    #[prost(message, tag = "8")]
    Ack(Acknowledgement),
    #[prost(message, tag = "9")]
    MemReq(MembershipRequest),
    #[prost(message, tag = "10")]
    MemRes(MembershipResponse),
    #[prost(message, tag = "11")]
    State(ChainState),
    #[prost(message, tag = "12")]
    StatePullRequest(ChainStatePullRequest),
    #[prost(message, tag = "13")]
    StatePullResponse(ChainStatePullResponse),
    #[prost(message, tag = "14")]
    StateInfo(ChainStateInfo),
}

/// A peer as carried on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct Member {
    #[prost(string, tag = "1")]
    pub endpoint: String,
    #[prost(bytes = "vec", tag = "2")]
    pub pki_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub metadata: Vec<u8>,
}

/// Logical timestamp on alive messages.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct PeerTime {
    #[prost(uint64, tag = "1")]
    pub inc_num: u64,
    #[prost(uint64, tag = "2")]
    pub seq_num: u64,
}

/// Signed heartbeat advertising a peer's presence.
///
/// `identity` is populated only during the publish-cert warm-up window
/// after the sender starts.
#[derive(Clone, PartialEq, Message)]
pub struct AliveMessage {
    #[prost(message, optional, tag = "1")]
    pub membership: Option<Member>,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<PeerTime>,
    #[prost(bytes = "vec", tag = "3")]
    pub identity: Vec<u8>,
}

/// First message on every authenticated stream.
#[derive(Clone, PartialEq, Message)]
pub struct ConnEstablish {
    #[prost(bytes = "vec", tag = "1")]
    pub pki_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub identity: Vec<u8>,
}

/// Anti-entropy request: "tell me about peers I don't already know".
#[derive(Clone, PartialEq, Message)]
pub struct MembershipRequest {
    /// The requester's own signed alive message.
    #[prost(message, optional, tag = "1")]
    pub self_information: Option<Envelope>,
    /// PKI-ids the requester already knows.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub known: Vec<Vec<u8>>,
}

/// Anti-entropy response: the responder's membership view.
#[derive(Clone, PartialEq, Message)]
pub struct MembershipResponse {
    #[prost(message, repeated, tag = "1")]
    pub alive: Vec<Envelope>,
    #[prost(message, repeated, tag = "2")]
    pub dead: Vec<Envelope>,
}

/// Versioned, signed declaration of a channel's membership and manifest.
///
/// `envelope` wraps an `RkSyncMessage` whose content is the
/// `ChainStateInfo`, signed by the channel leader.
#[derive(Clone, PartialEq, Message)]
pub struct ChainState {
    #[prost(uint64, tag = "1")]
    pub seq_num: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub chain_mac: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub envelope: Option<Envelope>,
}

/// The payload of a `ChainState` envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ChainStateInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub leader: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub members: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "3")]
    pub files: Vec<FileSyncInfo>,
}

/// Synchronization mode of a manifest file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enumeration)]
#[repr(i32)]
pub enum FileMode {
    Append = 0,
    Random = 1,
}

/// One manifest entry.
#[derive(Clone, PartialEq, Message)]
pub struct FileSyncInfo {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(enumeration = "FileMode", tag = "2")]
    pub mode: i32,
}

/// Ask a channel member for its current chain state.
#[derive(Clone, PartialEq, Message)]
pub struct ChainStatePullRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_mac: Vec<u8>,
}

/// Reply to a pull request; `element` is the responder's current
/// `ChainState`, re-encoded as a signed envelope.
#[derive(Clone, PartialEq, Message)]
pub struct ChainStatePullResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_mac: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub element: Option<Envelope>,
}

/// Error reply on a stream.
#[derive(Clone, PartialEq, Message)]
pub struct Acknowledgement {
    #[prost(string, tag = "1")]
    pub error: String,
}

/// Empty payload; also doubles as the unauthenticated ping probe.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct Empty {}

/// A peer identity as published on the wire: a stable node id plus the
/// node's public key bytes.
#[derive(Clone, PartialEq, Message)]
pub struct SerializedIdentity {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub id_bytes: Vec<u8>,
}

impl From<skein_model::FileSyncInfo> for FileSyncInfo {
    fn from(info: skein_model::FileSyncInfo) -> Self {
        let mode = match info.mode {
            skein_model::FileMode::Append => FileMode::Append,
            skein_model::FileMode::Random => FileMode::Random,
        };
        Self {
            path: info.path,
            mode: mode as i32,
        }
    }
}

impl From<FileSyncInfo> for skein_model::FileSyncInfo {
    fn from(proto: FileSyncInfo) -> Self {
        let mode = match FileMode::try_from(proto.mode) {
            Ok(FileMode::Random) => skein_model::FileMode::Random,
            _ => skein_model::FileMode::Append,
        };
        skein_model::FileSyncInfo {
            path: proto.path,
            mode,
        }
    }
}

impl From<skein_model::NetworkMember> for Member {
    fn from(member: skein_model::NetworkMember) -> Self {
        Self {
            endpoint: member.endpoint,
            pki_id: member.pki_id.as_bytes().to_vec(),
            metadata: member.metadata,
        }
    }
}

impl From<skein_model::PeerTime> for PeerTime {
    fn from(t: skein_model::PeerTime) -> Self {
        Self {
            inc_num: t.inc_num,
            seq_num: t.seq_num,
        }
    }
}

impl From<PeerTime> for skein_model::PeerTime {
    fn from(t: PeerTime) -> Self {
        skein_model::PeerTime::new(t.inc_num, t.seq_num)
    }
}
