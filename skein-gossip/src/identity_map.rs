//! Identity mapper
//!
//! Binds PKI-ids to serialized identities, signs with the node's key and
//! verifies remote signatures. Entries unused for the configured TTL are
//! purged by `sweep`; the purge notifier lets the service close the
//! expired peer's connection.

use skein_model::{GossipError, NodeIdentity, PeerIdentity, PkiId};
use skein_net::comm::{CommError, HandshakeAuth};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

type PurgeHook = Box<dyn Fn(&PkiId) + Send + Sync>;

struct StoredIdentity {
    identity: PeerIdentity,
    last_used: Instant,
}

/// PKI-id → identity store plus the node's own signing identity.
pub struct IdentityMapper {
    node: NodeIdentity,
    self_pki_id: PkiId,
    self_identity: PeerIdentity,
    usage_ttl: Duration,
    stored: RwLock<HashMap<PkiId, StoredIdentity>>,
    purge_hook: RwLock<Option<PurgeHook>>,
}

impl IdentityMapper {
    /// Build the mapper around the node's own identity; the self entry is
    /// stored immediately and never expires.
    pub fn new(node: NodeIdentity, node_id: &str, usage_ttl: Duration) -> Self {
        let self_identity = skein_proto::serialize_identity(node_id, &node.public_key_bytes());
        let self_pki_id =
            skein_model::crypto::pki_id_for(node_id, &node.public_key_bytes());

        let mut stored = HashMap::new();
        stored.insert(
            self_pki_id,
            StoredIdentity {
                identity: self_identity.clone(),
                last_used: Instant::now(),
            },
        );

        Self {
            node,
            self_pki_id,
            self_identity,
            usage_ttl,
            stored: RwLock::new(stored),
            purge_hook: RwLock::new(None),
        }
    }

    /// Install the callback invoked for each purged PKI-id. Wired after
    /// construction because the hook closes comm connections and the comm
    /// layer is built on top of this mapper.
    pub fn set_purge_hook(&self, hook: impl Fn(&PkiId) + Send + Sync + 'static) {
        *self.purge_hook.write().expect("purge hook poisoned") = Some(Box::new(hook));
    }

    pub fn self_pki_id(&self) -> PkiId {
        self.self_pki_id
    }

    pub fn self_identity(&self) -> PeerIdentity {
        self.self_identity.clone()
    }

    /// Bind `pki_id` to `identity`.
    ///
    /// Rejects a binding whose derived PKI-id differs from the claimed one
    /// and a rebind to a different identity; rebinding the identical
    /// identity is idempotent.
    pub fn put(&self, pki_id: PkiId, identity: PeerIdentity) -> Result<(), GossipError> {
        let derived = skein_proto::pki_id_of(&identity)
            .map_err(|e| GossipError::InvalidInput(e.to_string()))?;
        if derived != pki_id {
            return Err(GossipError::InvalidInput(
                "identity does not derive the claimed PKI-id".into(),
            ));
        }

        let mut stored = self.stored.write().expect("identity store poisoned");
        match stored.get_mut(&pki_id) {
            Some(existing) if existing.identity == identity => {
                existing.last_used = Instant::now();
                Ok(())
            }
            Some(_) => Err(GossipError::IdentityConflict),
            None => {
                stored.insert(
                    pki_id,
                    StoredIdentity {
                        identity,
                        last_used: Instant::now(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Fetch the identity bound to `pki_id`, refreshing its usage clock.
    pub fn get(&self, pki_id: &PkiId) -> Result<PeerIdentity, GossipError> {
        let mut stored = self.stored.write().expect("identity store poisoned");
        match stored.get_mut(pki_id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                Ok(entry.identity.clone())
            }
            None => Err(GossipError::NotFound(format!("identity of {pki_id}"))),
        }
    }

    /// Sign with the node's private key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.node.sign(message)
    }

    /// Verify `signature` over `message` for the peer bound to `pki_id`.
    pub fn verify(
        &self,
        pki_id: &PkiId,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), GossipError> {
        let identity = {
            let stored = self.stored.read().expect("identity store poisoned");
            stored
                .get(pki_id)
                .map(|entry| entry.identity.clone())
                .ok_or_else(|| GossipError::NotFound(format!("identity of {pki_id}")))?
        };
        skein_proto::verify_with_identity(&identity, message, signature)
            .map_err(|e| GossipError::SignatureInvalid(e.to_string()))
    }

    /// Purge identities unused for longer than the TTL, invoking the purge
    /// hook for each. The node's own identity is exempt.
    pub fn sweep(&self) {
        let expired: Vec<PkiId> = {
            let mut stored = self.stored.write().expect("identity store poisoned");
            let cutoff = self.usage_ttl;
            let self_id = self.self_pki_id;
            let expired: Vec<PkiId> = stored
                .iter()
                .filter(|(id, entry)| **id != self_id && entry.last_used.elapsed() > cutoff)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                stored.remove(id);
            }
            expired
        };

        if expired.is_empty() {
            return;
        }
        let hook = self.purge_hook.read().expect("purge hook poisoned");
        for id in &expired {
            tracing::debug!(peer = %id, "identity expired, purging");
            if let Some(hook) = hook.as_ref() {
                hook(id);
            }
        }
    }
}

impl HandshakeAuth for IdentityMapper {
    fn self_pki_id(&self) -> PkiId {
        self.self_pki_id
    }

    fn self_identity(&self) -> PeerIdentity {
        self.self_identity.clone()
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CommError> {
        Ok(self.node.sign(payload))
    }

    fn authenticate(
        &self,
        claimed: &PkiId,
        identity: &[u8],
        payload: &[u8],
        signature: &[u8],
    ) -> Result<(), CommError> {
        skein_proto::verify_with_identity(identity, payload, signature)
            .map_err(|e| CommError::Authentication(e.to_string()))?;
        self.put(*claimed, identity.to_vec())
            .map_err(|e| CommError::Authentication(e.to_string()))
    }
}
