//! Wire protocol for the skein gossip engine
//!
//! The message definitions are hand-maintained prost derives. Field
//! numbers are wire-compatible with the historical schema and MUST NOT be
//! renumbered; add new fields with fresh tags instead.

mod compare;
mod messages;
mod signed;

pub use compare::{alive_message_comparator, chain_state_comparator, Verdict};
pub use messages::*;
pub use signed::{ProtoError, SignedMessage, Signer, Verifier};

use prost::Message;
use skein_model::crypto;
use skein_model::{PeerIdentity, PkiId};

/// Encode a node's identity for publication inside alive messages and
/// handshakes.
pub fn serialize_identity(node_id: &str, public_key: &[u8]) -> PeerIdentity {
    SerializedIdentity {
        node_id: node_id.to_string(),
        id_bytes: public_key.to_vec(),
    }
    .encode_to_vec()
}

/// Decode a serialized identity blob.
pub fn deserialize_identity(identity: &[u8]) -> Result<SerializedIdentity, ProtoError> {
    let ident = SerializedIdentity::decode(identity)?;
    if ident.node_id.is_empty() || ident.id_bytes.is_empty() {
        return Err(ProtoError::MalformedIdentity);
    }
    Ok(ident)
}

/// Derive the PKI-id a serialized identity binds to.
pub fn pki_id_of(identity: &[u8]) -> Result<PkiId, ProtoError> {
    let ident = deserialize_identity(identity)?;
    Ok(crypto::pki_id_for(&ident.node_id, &ident.id_bytes))
}

/// Verify `signature` over `message` under the public key embedded in a
/// serialized identity.
pub fn verify_with_identity(
    identity: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), ProtoError> {
    let ident = deserialize_identity(identity)?;
    crypto::verify(&ident.id_bytes, message, signature).map_err(ProtoError::Crypto)
}
