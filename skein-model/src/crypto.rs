//! Centralized cryptographic operations for skein.
//!
//! All SHA-256 digest derivation and Ed25519 signing/verification go
//! through this module.
//!
//! | Primitive | Algorithm       | Purpose                                  |
//! |-----------|-----------------|------------------------------------------|
//! | Digest    | SHA-256 (32 B)  | PKI-id derivation, chain MAC derivation  |
//! | Signature | Ed25519 (64 B)  | Message envelopes, handshake attestation |

use crate::types::{ChainMac, PkiId};
use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive a peer's PKI-id from its node id and public identity bytes.
///
/// `SHA-256(node_id ‖ id_bytes)`: deterministic, so every peer derives the
/// same handle from the same identity, and collision-resistant, so the
/// handle cannot be forged for a different key.
pub fn pki_id_for(node_id: &str, id_bytes: &[u8]) -> PkiId {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(id_bytes);
    PkiId(hasher.finalize().into())
}

/// Derive the MAC that binds a channel name to its creator.
///
/// `SHA-256(leader_pki_id ‖ chain_id)`. Members validate an incoming chain
/// state by recomputing this from the declared leader.
pub fn chain_mac(leader: &PkiId, chain_id: &str) -> ChainMac {
    let mut hasher = Sha256::new();
    hasher.update(leader.as_bytes());
    hasher.update(chain_id.as_bytes());
    ChainMac(hasher.finalize().into())
}

/// Sign a message with an Ed25519 signing key.
pub fn sign(key: &ed25519_dalek::SigningKey, message: &[u8]) -> Vec<u8> {
    use ed25519_dalek::Signer;
    key.sign(message).to_vec()
}

/// Verify an Ed25519 signature against a raw 32-byte public key.
pub fn verify(pubkey_bytes: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    use ed25519_dalek::Verifier;
    let key_bytes: &[u8; 32] = pubkey_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let key = ed25519_dalek::VerifyingKey::from_bytes(key_bytes)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig_bytes: &[u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(sig_bytes);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Cryptographic operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid Ed25519 signature")]
    InvalidSignature,

    #[error("invalid Ed25519 public key")]
    InvalidPublicKey,
}
