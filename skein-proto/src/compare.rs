//! Replacement verdicts for message deduplication
//!
//! The message store keeps at most one live message per "slot" (a peer for
//! alive messages, a chain MAC for channel states). The comparator decides
//! whether an incoming message takes over a slot.

use crate::messages::Content;
use crate::signed::SignedMessage;
use skein_model::PeerTime;

/// Relation of an incoming message to a stored one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Same slot, same version: drop the incoming message.
    Equal,
    /// Same slot, incoming is newer: evict the stored message.
    Replaces,
    /// Same slot, incoming is older: drop the incoming message.
    ReplacedBy,
    /// Different slots: both coexist.
    Unrelated,
}

/// Compare two alive messages: the slot is the sender's PKI-id, the
/// version its `PeerTime`.
pub fn alive_message_comparator(new: &SignedMessage, old: &SignedMessage) -> Verdict {
    let (Some(Content::AliveMsg(a)), Some(Content::AliveMsg(b))) =
        (&new.message.content, &old.message.content)
    else {
        return Verdict::Unrelated;
    };

    let same_peer = match (&a.membership, &b.membership) {
        (Some(ma), Some(mb)) => ma.pki_id == mb.pki_id,
        _ => false,
    };
    if !same_peer {
        return Verdict::Unrelated;
    }

    let ts = |alive: &crate::messages::AliveMessage| -> PeerTime {
        alive
            .timestamp
            .map(PeerTime::from)
            .unwrap_or(PeerTime::new(0, 0))
    };

    match ts(a).cmp(&ts(b)) {
        std::cmp::Ordering::Greater => Verdict::Replaces,
        std::cmp::Ordering::Less => Verdict::ReplacedBy,
        std::cmp::Ordering::Equal => Verdict::Equal,
    }
}

/// Compare two chain-state messages: the slot is the chain MAC, the
/// version the state's `seq_num`. Equal sequence numbers fall back to a
/// stable byte-wise payload comparison so concurrent duplicates converge
/// on the same winner everywhere.
pub fn chain_state_comparator(new: &SignedMessage, old: &SignedMessage) -> Verdict {
    let (Some(Content::State(a)), Some(Content::State(b))) =
        (&new.message.content, &old.message.content)
    else {
        return Verdict::Unrelated;
    };

    if a.chain_mac != b.chain_mac {
        return Verdict::Unrelated;
    }

    match a.seq_num.cmp(&b.seq_num) {
        std::cmp::Ordering::Greater => Verdict::Replaces,
        std::cmp::Ordering::Less => Verdict::ReplacedBy,
        std::cmp::Ordering::Equal => match new.envelope.payload.cmp(&old.envelope.payload) {
            std::cmp::Ordering::Greater => Verdict::Replaces,
            std::cmp::Ordering::Less => Verdict::ReplacedBy,
            std::cmp::Ordering::Equal => Verdict::Equal,
        },
    }
}
