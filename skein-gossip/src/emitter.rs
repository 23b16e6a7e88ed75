//! Batching emitter
//!
//! Coalesces outbound gossip into bursts bounded by size and latency.
//! Every message carries a remaining-iterations counter; after each burst
//! the counter decrements and messages with iterations left are requeued,
//! so a message rides `propagate_iterations` consecutive bursts.

use futures_util::future::BoxFuture;
use skein_model::PkiId;
use skein_proto::SignedMessage;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Filter over candidate recipients, applied at send time.
pub type PeerFilter = Arc<dyn Fn(&PkiId) -> bool + Send + Sync>;

/// Callback that ships one burst; the service implements it as
/// "classify, select peers, send".
pub type EmitBatch = Arc<dyn Fn(Vec<EmittedMessage>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A message queued for dissemination.
#[derive(Clone)]
pub struct EmittedMessage {
    pub msg: SignedMessage,
    pub filter: PeerFilter,
    pub iterations_left: usize,
}

impl EmittedMessage {
    pub fn new(msg: SignedMessage, filter: PeerFilter, iterations: usize) -> Self {
        Self {
            msg,
            filter,
            iterations_left: iterations,
        }
    }
}

struct EmitterState {
    buffer: Vec<EmittedMessage>,
    stopped: bool,
}

/// Burst-batching gossip emitter.
pub struct BatchingEmitter {
    state: Arc<Mutex<EmitterState>>,
    kick: Arc<Notify>,
    burst_size: usize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingEmitter {
    /// `emit` ships each burst; `iterations` is the default replay count
    /// stamped on messages added through [`BatchingEmitter::add`].
    pub fn new(
        burst_size: usize,
        burst_latency: std::time::Duration,
        emit: EmitBatch,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let state = Arc::new(Mutex::new(EmitterState {
            buffer: Vec::new(),
            stopped: false,
        }));
        let kick = Arc::new(Notify::new());

        let loop_state = state.clone();
        let loop_kick = kick.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(burst_latency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let flush = tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => {
                        // final drain before exiting
                        Self::emit_round(&loop_state, &emit, true).await;
                        break;
                    }
                    _ = ticker.tick() => true,
                    _ = loop_kick.notified() => {
                        let state = loop_state.lock().expect("emitter buffer poisoned");
                        state.buffer.len() >= burst_size
                    }
                };
                if flush {
                    Self::emit_round(&loop_state, &emit, false).await;
                }
            }
            tracing::debug!("emitter loop exiting");
        });

        Self {
            state,
            kick,
            burst_size,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a message for the next burst. Never blocks beyond the buffer
    /// lock; a full-size buffer wakes the burst loop immediately.
    pub fn add(&self, msg: EmittedMessage) {
        if msg.iterations_left == 0 {
            return;
        }
        let should_kick = {
            let mut state = self.state.lock().expect("emitter buffer poisoned");
            if state.stopped {
                return;
            }
            state.buffer.push(msg);
            state.buffer.len() >= self.burst_size
        };
        if should_kick {
            self.kick.notify_one();
        }
    }

    /// Messages currently buffered; for tests and introspection.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("emitter buffer poisoned").buffer.len()
    }

    /// Drain one final burst and stop the loop.
    pub async fn stop(&self) {
        let task = {
            let mut guard = self.task.lock().expect("emitter task poisoned");
            guard.take()
        };
        if let Some(task) = task {
            // the shutdown watch has flipped by the time stop() is called;
            // awaiting the task observes the final drain
            let _ = task.await;
        }
        self.state.lock().expect("emitter buffer poisoned").stopped = true;
    }

    async fn emit_round(state: &Arc<Mutex<EmitterState>>, emit: &EmitBatch, last: bool) {
        let batch: Vec<EmittedMessage> = {
            let mut guard = state.lock().expect("emitter buffer poisoned");
            if last {
                guard.stopped = true;
            }
            std::mem::take(&mut guard.buffer)
        };
        if batch.is_empty() {
            return;
        }

        tracing::trace!(count = batch.len(), "emitting gossip burst");
        emit(batch.clone()).await;

        if last {
            return;
        }
        // requeue messages that still have iterations to ride
        let mut guard = state.lock().expect("emitter buffer poisoned");
        for mut msg in batch {
            msg.iterations_left -= 1;
            if msg.iterations_left > 0 {
                guard.buffer.push(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_proto::{Content, Empty, RkSyncMessage, Tag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn message() -> SignedMessage {
        SignedMessage::noop_sign(RkSyncMessage {
            nonce: 1,
            channel: vec![],
            tag: Tag::Empty as i32,
            content: Some(Content::Empty(Empty {})),
        })
    }

    fn counting_emit() -> (EmitBatch, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let bursts = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(AtomicUsize::new(0));
        let (b, m) = (bursts.clone(), messages.clone());
        let emit: EmitBatch = Arc::new(move |batch: Vec<EmittedMessage>| {
            b.fetch_add(1, Ordering::SeqCst);
            m.fetch_add(batch.len(), Ordering::SeqCst);
            Box::pin(async {})
        });
        (emit, bursts, messages)
    }

    fn emitted(iterations: usize) -> EmittedMessage {
        EmittedMessage::new(message(), Arc::new(|_| true), iterations)
    }

    #[tokio::test]
    async fn full_buffer_triggers_burst_before_latency() {
        let (emit, bursts, messages) = counting_emit();
        let (_tx, rx) = watch::channel(false);
        let emitter = BatchingEmitter::new(2, Duration::from_secs(60), emit, rx);

        emitter.add(emitted(1));
        emitter.add(emitted(1));

        tokio::time::timeout(Duration::from_secs(2), async {
            while messages.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("burst before latency tick");
        assert!(bursts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn latency_flushes_partial_burst() {
        let (emit, _bursts, messages) = counting_emit();
        let (_tx, rx) = watch::channel(false);
        let emitter = BatchingEmitter::new(100, Duration::from_millis(20), emit, rx);

        emitter.add(emitted(1));

        tokio::time::timeout(Duration::from_secs(2), async {
            while messages.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("latency flush");
    }

    #[tokio::test]
    async fn iterations_replay_across_bursts() {
        let (emit, _bursts, messages) = counting_emit();
        let (_tx, rx) = watch::channel(false);
        let emitter = BatchingEmitter::new(100, Duration::from_millis(10), emit, rx);

        emitter.add(emitted(3));

        tokio::time::timeout(Duration::from_secs(2), async {
            while messages.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("three replays");

        // no fourth replay
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(messages.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_iterations_are_dropped_on_add() {
        let (emit, _, messages) = counting_emit();
        let (_tx, rx) = watch::channel(false);
        let emitter = BatchingEmitter::new(100, Duration::from_millis(10), emit, rx);

        emitter.add(emitted(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(messages.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.pending(), 0);
    }

    #[tokio::test]
    async fn stop_drains_buffered_messages() {
        let (emit, _, messages) = counting_emit();
        let (tx, rx) = watch::channel(false);
        let emitter = BatchingEmitter::new(100, Duration::from_secs(60), emit, rx);

        emitter.add(emitted(5));
        tx.send(true).expect("signal shutdown");
        emitter.stop().await;

        assert_eq!(messages.load(Ordering::SeqCst), 1);
        // adds after stop are discarded
        emitter.add(emitted(1));
        assert_eq!(emitter.pending(), 0);
    }
}
