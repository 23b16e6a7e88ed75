//! Accept-filter demultiplexer
//!
//! Every registered predicate gets its own bounded queue; each inbound
//! message is offered to every subscriber whose predicate matches. Fan-out
//! is lossy: a full subscriber queue drops the message for that subscriber
//! only, so one slow consumer cannot stall the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

const SUBSCRIBER_QUEUE_DEPTH: usize = 100;

type Predicate<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;

struct Subscriber<M> {
    predicate: Predicate<M>,
    tx: mpsc::Sender<M>,
}

/// Predicate-subscribed message fan-out.
///
/// The subscriber list is copy-on-write: `demux` clones the current list
/// under a read lock and delivers without holding it.
pub struct Demux<M> {
    subscribers: RwLock<Vec<Arc<Subscriber<M>>>>,
    closed: AtomicBool,
}

impl<M: Clone + Send + 'static> Demux<M> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a predicate; returns the queue it will be fed through.
    pub fn add_channel(&self, predicate: Predicate<M>) -> mpsc::Receiver<M> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let sub = Arc::new(Subscriber { predicate, tx });
        let mut subs = self.subscribers.write().expect("demux lock poisoned");
        subs.push(sub);
        rx
    }

    /// Offer a message to every matching subscriber.
    pub fn demux(&self, msg: M) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let subs = {
            let guard = self.subscribers.read().expect("demux lock poisoned");
            guard.clone()
        };
        for sub in subs {
            if (sub.predicate)(&msg) {
                if let Err(e) = sub.tx.try_send(msg.clone()) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            tracing::warn!("demux subscriber queue full, dropping message");
                        }
                        mpsc::error::TrySendError::Closed(_) => {}
                    }
                }
            }
        }
    }

    /// Drop all subscribers; subsequent messages are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut subs = self.subscribers.write().expect("demux lock poisoned");
        subs.clear();
    }
}

impl<M: Clone + Send + 'static> Default for Demux<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let demux: Demux<u32> = Demux::new();
        let mut evens = demux.add_channel(Arc::new(|m: &u32| m % 2 == 0));
        let mut all = demux.add_channel(Arc::new(|_: &u32| true));

        demux.demux(1);
        demux.demux(2);

        assert_eq!(evens.recv().await, Some(2));
        assert_eq!(all.recv().await, Some(1));
        assert_eq!(all.recv().await, Some(2));
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_subscriber() {
        let demux: Demux<u32> = Demux::new();
        let mut slow = demux.add_channel(Arc::new(|_: &u32| true));
        let mut fast = demux.add_channel(Arc::new(|_: &u32| true));

        for i in 0..(SUBSCRIBER_QUEUE_DEPTH as u32 + 10) {
            demux.demux(i);
            // keep the fast consumer drained
            assert_eq!(fast.recv().await, Some(i));
        }

        // slow consumer saw the first QUEUE_DEPTH messages, the rest dropped
        for i in 0..SUBSCRIBER_QUEUE_DEPTH as u32 {
            assert_eq!(slow.recv().await, Some(i));
        }
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_stops_delivery() {
        let demux: Demux<u32> = Demux::new();
        let mut rx = demux.add_channel(Arc::new(|_: &u32| true));
        demux.close();
        demux.demux(1);
        assert!(rx.recv().await.is_none());
    }
}
