//! Strong types for the gossip data model
//!
//! Fixed-size digests are newtypes over `[u8; 32]` rather than raw byte
//! vectors so that a PKI-id can never be confused with a chain MAC.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A serialized peer identity blob (encoded `SerializedIdentity`).
pub type PeerIdentity = Vec<u8>;

macro_rules! digest_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Returns the inner digest bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parses a digest from an arbitrary byte slice.
            ///
            /// Fails when the slice is not exactly 32 bytes, which is how
            /// malformed wire fields surface.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; 32]>::try_from(bytes).ok().map(Self)
            }

            /// Parse from a hex string, as printed by `Display`.
            pub fn from_hex(hex_str: &str) -> Result<Self, String> {
                let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {}", e))?;
                Self::from_slice(&bytes)
                    .ok_or_else(|| format!("expected 64 hex characters, got {}", hex_str.len()))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

digest_type!(
    PkiId,
    "SHA-256 digest binding a node id to its identity key. The stable handle for a peer."
);
digest_type!(
    ChainMac,
    "SHA-256 digest binding a channel name to its creator's PKI-id. The unforgeable channel handle."
);

/// A peer as seen by the membership layer.
///
/// An alive member carries the endpoint it can be dialed on; a record kept
/// only to remember a dead peer may have an empty endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMember {
    pub endpoint: String,
    pub pki_id: PkiId,
    pub metadata: Vec<u8>,
}

impl NetworkMember {
    pub fn new(endpoint: impl Into<String>, pki_id: PkiId) -> Self {
        Self {
            endpoint: endpoint.into(),
            pki_id,
            metadata: Vec::new(),
        }
    }

    /// Whether the member can currently be dialed.
    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

impl fmt::Debug for NetworkMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pki_id, self.endpoint)
    }
}

impl fmt::Display for NetworkMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Logical timestamp a peer stamps on its alive messages.
///
/// `inc_num` is the peer's boot epoch and `seq_num` a per-epoch counter, so
/// comparison is lexicographic: a restarted peer always supersedes its
/// pre-restart heartbeats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerTime {
    pub inc_num: u64,
    pub seq_num: u64,
}

impl PeerTime {
    pub fn new(inc_num: u64, seq_num: u64) -> Self {
        Self { inc_num, seq_num }
    }
}

/// Synchronization mode for a file in a channel manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    /// File only ever grows; peers sync the tail.
    Append,
    /// File is updated in place; peers sync whole content.
    Random,
}

/// One entry in a channel's file manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSyncInfo {
    pub path: String,
    pub mode: FileMode,
}

impl FileSyncInfo {
    pub fn new(path: impl Into<String>, mode: FileMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_is_hex() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let id = PkiId(bytes);
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab"));
        assert!(hex.ends_with("01"));
    }

    #[test]
    fn digest_from_slice_rejects_wrong_length() {
        assert!(PkiId::from_slice(&[1, 2, 3]).is_none());
        assert!(PkiId::from_slice(&[7u8; 32]).is_some());
    }

    #[test]
    fn digest_hex_roundtrip() {
        let id = PkiId([0x5au8; 32]);
        assert_eq!(PkiId::from_hex(&id.to_string()), Ok(id));

        assert!(PkiId::from_hex("not hex").is_err());
        assert!(PkiId::from_hex("abcd").is_err());
    }

    #[test]
    fn peer_time_orders_lexicographically() {
        let old_epoch = PeerTime::new(1, 99);
        let new_epoch = PeerTime::new(2, 0);
        assert!(new_epoch > old_epoch);

        let earlier = PeerTime::new(2, 3);
        let later = PeerTime::new(2, 4);
        assert!(later > earlier);
        assert_eq!(earlier, PeerTime::new(2, 3));
    }
}
