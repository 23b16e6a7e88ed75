//! Deduplicating message store
//!
//! Keeps the most recent message per slot as decided by a comparator:
//! alive messages keyed by sender, chain states keyed by chain MAC.
//! The expirable variant drops entries after a TTL, with hooks running
//! before and after each expiry batch.

use skein_proto::{SignedMessage, Verdict};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Decides how an incoming message relates to a stored one.
pub type Comparator = fn(&SignedMessage, &SignedMessage) -> Verdict;

/// Runs around expiry; the pre hook can take an external lock, the post
/// hook reacts to the evicted messages.
pub type ExpireHook = Box<dyn Fn(&[SignedMessage]) + Send + Sync>;

struct Entry {
    msg: SignedMessage,
    added: Instant,
}

/// Comparator-driven dedup set with optional expiry.
pub struct MessageStore {
    compare: Comparator,
    ttl: Option<Duration>,
    entries: Mutex<Vec<Entry>>,
    pre_expire: Option<ExpireHook>,
    post_expire: Option<ExpireHook>,
}

impl MessageStore {
    /// A store that never expires entries.
    pub fn new(compare: Comparator) -> Self {
        Self {
            compare,
            ttl: None,
            entries: Mutex::new(Vec::new()),
            pre_expire: None,
            post_expire: None,
        }
    }

    /// A store whose entries expire `ttl` after insertion. Hooks default
    /// to no-ops.
    pub fn expirable(
        compare: Comparator,
        ttl: Duration,
        pre_expire: Option<ExpireHook>,
        post_expire: Option<ExpireHook>,
    ) -> Self {
        Self {
            compare,
            ttl: Some(ttl),
            entries: Mutex::new(Vec::new()),
            pre_expire,
            post_expire,
        }
    }

    /// Insert `msg` unless an existing entry supersedes it. Entries the
    /// message supersedes are removed. Returns whether it was inserted.
    pub fn add(&self, msg: SignedMessage) -> bool {
        let mut entries = self.entries.lock().expect("message store poisoned");
        let mut superseded = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            match (self.compare)(&msg, &entry.msg) {
                Verdict::Equal | Verdict::ReplacedBy => return false,
                Verdict::Replaces => superseded.push(idx),
                Verdict::Unrelated => {}
            }
        }
        for idx in superseded.into_iter().rev() {
            entries.remove(idx);
        }
        entries.push(Entry {
            msg,
            added: Instant::now(),
        });
        true
    }

    /// Whether `msg` would be accepted, without inserting it.
    pub fn check_valid(&self, msg: &SignedMessage) -> bool {
        let entries = self.entries.lock().expect("message store poisoned");
        !entries.iter().any(|entry| {
            matches!(
                (self.compare)(msg, &entry.msg),
                Verdict::Equal | Verdict::ReplacedBy
            )
        })
    }

    /// Snapshot of the live messages.
    pub fn get_all(&self) -> Vec<SignedMessage> {
        let entries = self.entries.lock().expect("message store poisoned");
        entries.iter().map(|entry| entry.msg.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("message store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every message matching the predicate.
    pub fn purge(&self, pred: impl Fn(&SignedMessage) -> bool) {
        let mut entries = self.entries.lock().expect("message store poisoned");
        entries.retain(|entry| !pred(&entry.msg));
    }

    /// Drop entries older than the TTL and run the expiry hooks on them.
    /// No-op for stores built without a TTL.
    pub fn sweep(&self) {
        let Some(ttl) = self.ttl else { return };
        let expired: Vec<SignedMessage> = {
            let mut entries = self.entries.lock().expect("message store poisoned");
            let (dead, live): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| entry.added.elapsed() > ttl);
            *entries = live;
            dead.into_iter().map(|entry| entry.msg).collect()
        };
        if expired.is_empty() {
            return;
        }
        if let Some(hook) = &self.pre_expire {
            hook(&expired);
        }
        tracing::debug!(count = expired.len(), "message store expired entries");
        if let Some(hook) = &self.post_expire {
            hook(&expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_proto::{
        alive_message_comparator, chain_state_comparator, AliveMessage, ChainState, Content,
        Member, PeerTime, RkSyncMessage, Tag,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn alive(pki: u8, seq: u64) -> SignedMessage {
        SignedMessage::noop_sign(RkSyncMessage {
            nonce: 0,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::AliveMsg(AliveMessage {
                membership: Some(Member {
                    endpoint: "e".into(),
                    pki_id: vec![pki; 32],
                    metadata: vec![],
                }),
                timestamp: Some(PeerTime {
                    inc_num: 1,
                    seq_num: seq,
                }),
                identity: vec![],
            })),
        })
    }

    fn state(mac: u8, seq: u64) -> SignedMessage {
        SignedMessage::noop_sign(RkSyncMessage {
            nonce: 0,
            channel: b"c".to_vec(),
            tag: Tag::ChanOnly as i32,
            content: Some(Content::State(ChainState {
                seq_num: seq,
                chain_mac: vec![mac; 32],
                envelope: None,
            })),
        })
    }

    #[test]
    fn newer_message_supersedes_and_older_is_rejected() {
        let store = MessageStore::new(alive_message_comparator);

        assert!(store.add(alive(1, 1)));
        assert!(store.add(alive(1, 2)));
        assert_eq!(store.len(), 1);

        // replay of the superseded heartbeat
        assert!(!store.add(alive(1, 1)));
        assert!(!store.add(alive(1, 2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unrelated_messages_coexist() {
        let store = MessageStore::new(alive_message_comparator);
        assert!(store.add(alive(1, 1)));
        assert!(store.add(alive(2, 1)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn stale_chain_state_is_rejected() {
        let store = MessageStore::new(chain_state_comparator);
        assert!(store.add(state(1, 2)));
        assert!(!store.check_valid(&state(1, 1)));
        assert!(!store.add(state(1, 1)));
        assert!(store.check_valid(&state(1, 3)));
        assert!(store.add(state(1, 3)));
        assert!(store.add(state(2, 1)));
        assert_eq!(store.len(), 2);

        // only the freshest state per chain survives
        let seqs: Vec<u64> = store
            .get_all()
            .iter()
            .filter_map(|msg| msg.message.chain_state().map(|s| s.seq_num))
            .collect();
        assert!(seqs.contains(&3) && seqs.contains(&1));
    }

    #[test]
    fn purge_removes_matching_entries() {
        let store = MessageStore::new(alive_message_comparator);
        store.add(alive(1, 1));
        store.add(alive(2, 1));

        store.purge(|msg| {
            msg.message
                .alive()
                .and_then(|a| a.membership.as_ref())
                .is_some_and(|m| m.pki_id == vec![1u8; 32])
        });
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_expires_and_runs_hooks() {
        let pre = Arc::new(AtomicUsize::new(0));
        let post = Arc::new(AtomicUsize::new(0));
        let (pre_hook, post_hook) = (pre.clone(), post.clone());

        let store = MessageStore::expirable(
            alive_message_comparator,
            Duration::from_millis(0),
            Some(Box::new(move |expired| {
                pre_hook.fetch_add(expired.len(), Ordering::SeqCst);
            })),
            Some(Box::new(move |expired| {
                post_hook.fetch_add(expired.len(), Ordering::SeqCst);
            })),
        );

        store.add(alive(1, 1));
        store.add(alive(2, 1));
        std::thread::sleep(Duration::from_millis(5));
        store.sweep();

        assert!(store.is_empty());
        assert_eq!(pre.load(Ordering::SeqCst), 2);
        assert_eq!(post.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sweep_without_ttl_is_a_noop() {
        let store = MessageStore::new(alive_message_comparator);
        store.add(alive(1, 1));
        store.sweep();
        assert_eq!(store.len(), 1);
    }
}
