//! Engine-wide error kinds
//!
//! API calls surface these to the caller; loop code logs and drops instead
//! of propagating, so no single bad message can kill a loop.

use thiserror::Error;

/// Errors surfaced by the gossip engine's public operations.
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation requires channel leadership")]
    NotLeader,

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("PKI-id is already bound to a different identity")]
    IdentityConflict,

    #[error("service is stopping")]
    Stopped,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("stale message: {0}")]
    Stale(String),
}

impl From<crate::crypto::CryptoError> for GossipError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        GossipError::SignatureInvalid(err.to_string())
    }
}
