//! `EventPump` (spec §4.5): at-most-once notification of state-machine
//! writes to a user callback, delivered only after the owning transaction
//! commits.
//!
//! Grounded in `original_source/raft/state_machine_event.go`'s
//! `StateMachineEvent`/`StateMachineEventBatch`: a channel sized like a
//! bounded queue of capacity 200 feeds a single consumer, batched per
//! `Update` call and flushed only on `Commit`. Per spec §5, the producer
//! side (the Raft apply path) must never block on a full queue, so the
//! channel itself is unbounded and `send` never awaits a slot — only the
//! *intent* of a 200-deep buffer is kept, as a high-water mark a strict
//! implementer could alert on, not as a back-pressure valve. Panics inside
//! the user callback are caught rather than allowed to bring down the
//! consumer task, mirroring the original's `recover()` in `runOne`.
//! `close()` stops the consumer and is awaited during shutdown so no events
//! are left stranded mid-flight (spec §4.5, §5).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::types::Item;

/// Nominal queue depth (spec §4.5). The channel itself is unbounded — see
/// the module doc — this is only the threshold past which a lag warning is
/// logged.
const CHANNEL_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
pub struct EventValue {
    pub new_item: Option<Item>,
    pub old_item: Option<Item>,
}

pub type EventCallback = Arc<dyn Fn(u64, u64, Option<Item>, Option<Item>) + Send + Sync>;

/// Event queue for one partition (`cluster_id`/`node_id`). Unbounded so the
/// Raft apply path producing events never blocks on a slow consumer.
///
/// `tx` is wrapped in a `Mutex<Option<_>>` so [`EventPump::close`] can drop
/// it through a shared reference — `EventPump` is held behind `Arc` and
/// cloned into `StateMachine`'s snapshot builder, so `close` cannot take
/// `self` by value. Dropping every sender makes the consumer's `recv().await`
/// return `None`, ending the task on its own.
pub struct EventPump {
    tx: Mutex<Option<mpsc::UnboundedSender<EventValue>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cluster_id: u64,
    node_id: u64,
}

impl EventPump {
    /// Spawns the consumer task and returns a handle. `callback` is `None`
    /// when no observer is registered, in which case events are dropped
    /// without ever being enqueued (matches the original's early return in
    /// `Add` when `event == nil`).
    pub fn start(cluster_id: u64, node_id: u64, callback: Option<EventCallback>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventValue>();

        let handle = callback.map(|callback| {
            tokio::spawn(async move {
                let mut warned_lagging = false;
                while let Some(value) = rx.recv().await {
                    if rx.len() >= CHANNEL_CAPACITY && !warned_lagging {
                        warned_lagging = true;
                        error!(
                            cluster_id,
                            node_id,
                            queued = rx.len(),
                            "event pump consumer falling behind producer"
                        );
                    } else if rx.len() < CHANNEL_CAPACITY {
                        warned_lagging = false;
                    }
                    let callback = callback.clone();
                    let new_item = value.new_item.clone();
                    let old_item = value.old_item.clone();
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        callback(cluster_id, node_id, new_item, old_item);
                    }));
                    if let Err(panic) = result {
                        let message = panic_message(&panic);
                        error!(cluster_id, node_id, error = %message, "event callback panicked");
                    }
                }
            })
        });

        EventPump {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(handle),
            cluster_id,
            node_id,
        }
    }

    pub fn batch(&self) -> EventBatch<'_> {
        EventBatch {
            pump: self,
            values: Vec::new(),
        }
    }

    /// Stops the consumer, drains whatever is already queued, and returns
    /// only once the consumer task has exited (spec §4.5, §5). Dropping the
    /// sender unblocks `rx.recv()` with `None` once the queue empties;
    /// idempotent if called more than once.
    pub async fn close(&self) {
        self.tx.lock().unwrap().take();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(
                    cluster_id = self.cluster_id,
                    node_id = self.node_id,
                    error = %e,
                    "event pump consumer task panicked while closing"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Accumulates events during one `Update` call; only reaches the consumer
/// once `commit()` is called, so a rolled-back update never emits a stray
/// notification (spec §4.5).
pub struct EventBatch<'a> {
    pump: &'a EventPump,
    values: Vec<EventValue>,
}

impl<'a> EventBatch<'a> {
    pub fn add(&mut self, new_item: Option<Item>, old_item: Option<Item>) {
        self.values.push(EventValue { new_item, old_item });
    }

    /// Flushes the batch to the pump. Never awaits a free slot — the
    /// channel is unbounded — so this can never apply back-pressure to the
    /// Raft apply path that calls it (spec §5). A pump that has been
    /// `close()`d (or whose consumer is gone) silently drops the remainder
    /// of the batch rather than erroring the caller.
    pub async fn commit(self) {
        let tx = self.pump.tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            if !self.values.is_empty() {
                error!(
                    cluster_id = self.pump.cluster_id,
                    node_id = self.pump.node_id,
                    "event pump closed, dropping event batch"
                );
            }
            return;
        };
        for value in self.values {
            if tx.send(value).is_err() {
                error!(
                    cluster_id = self.pump.cluster_id,
                    node_id = self.pump.node_id,
                    "event pump consumer gone, dropping event"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn delivers_events_only_on_commit() {
        let received: Arc<Mutex<Vec<(Option<Item>, Option<Item>)>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let callback: EventCallback = Arc::new(move |_c, _n, new_item, old_item| {
            received_clone.lock().unwrap().push((new_item, old_item));
        });

        let pump = EventPump::start(1, 1, Some(callback));
        let mut batch = pump.batch();
        batch.add(
            Some(Item { key: b"k".to_vec(), value: b"v".to_vec(), expire: 0 }),
            None,
        );
        // Not committed yet: nothing should be delivered.
        assert!(received.lock().unwrap().is_empty());
        batch.commit().await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_consumer() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let callback: EventCallback = Arc::new(move |_c, _n, _new, _old| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });

        let pump = EventPump::start(1, 1, Some(callback));
        for _ in 0..3 {
            let mut batch = pump.batch();
            batch.add(None, None);
            batch.commit().await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn close_drains_pending_events_then_returns() {
        let received: Arc<Mutex<Vec<Option<Item>>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let callback: EventCallback = Arc::new(move |_c, _n, new_item, _old| {
            received_clone.lock().unwrap().push(new_item);
        });

        let pump = EventPump::start(1, 1, Some(callback));
        let mut batch = pump.batch();
        for i in 0..5u8 {
            batch.add(Some(Item { key: vec![i], value: Vec::new(), expire: 0 }), None);
        }
        batch.commit().await;

        // close() must not return until the consumer has drained the batch
        // and exited.
        pump.close().await;
        assert_eq!(received.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn commit_after_close_is_dropped_not_errored() {
        let pump = EventPump::start(1, 1, None);
        pump.close().await;
        let mut batch = pump.batch();
        batch.add(Some(Item { key: b"k".to_vec(), value: Vec::new(), expire: 0 }), None);
        batch.commit().await;
    }
}
