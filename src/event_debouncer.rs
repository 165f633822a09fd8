//! Schema-event debouncer (spec.md §4.5).
//!
//! Collapses a burst of `SCHEMA_CHANGE` events into one refresh per
//! distinct CQL object: a later event for the same keyspace/object replaces
//! an earlier one queued within the same quiescence window, and the whole
//! queue flushes together after `refresh_schema_delay` of silence (or
//! immediately, for `processNow=true` callers such as an explicit
//! `DROPPED` event).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::frame::SchemaChangeResult;

/// Identifies one coalescable unit of schema-change work: a keyspace on
/// its own, or a specific object within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub keyspace: String,
    pub target: String,
    pub object_name: Option<String>,
}

impl From<&SchemaChangeResult> for DebounceKey {
    fn from(event: &SchemaChangeResult) -> Self {
        Self {
            keyspace: event.keyspace.clone(),
            target: event.target.clone(),
            object_name: event.object_name.clone(),
        }
    }
}

/// Coalesces schema events keyed by [`DebounceKey`]; the queue is a map,
/// so re-queuing the same key just replaces the pending event (spec.md
/// §4.5: "the later event wins").
pub struct EventDebouncer {
    delay: Duration,
    pending: Mutex<HashMap<DebounceKey, SchemaChangeResult>>,
    flush: Arc<tokio::sync::Notify>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for EventDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDebouncer").finish_non_exhaustive()
    }
}

impl EventDebouncer {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            pending: Mutex::new(HashMap::new()),
            flush: Arc::new(tokio::sync::Notify::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Queues one event. `process_now` flushes immediately, bypassing the
    /// quiescence timer (spec.md §4.5 `processNow=true`).
    pub async fn queue(self: &Arc<Self>, event: SchemaChangeResult, process_now: bool) {
        {
            let mut guard = self.pending.lock().await;
            guard.insert(DebounceKey::from(&event), event);
        }
        if process_now {
            self.flush.notify_one();
        } else {
            let debouncer = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(debouncer.delay).await;
                debouncer.flush.notify_one();
            });
        }
    }

    /// Drains everything queued so far. Called by the Control Connection's
    /// background task once `flush` is notified; returns the coalesced
    /// set, most-recent event per key.
    pub async fn drain(&self) -> Vec<SchemaChangeResult> {
        let mut guard = self.pending.lock().await;
        guard.drain().map(|(_, v)| v).collect()
    }

    /// Runs until [`Self::shutdown`] is called, handing each coalesced
    /// batch to `handler`. Intended to be spawned once per Control
    /// Connection lifetime.
    pub async fn run(self: Arc<Self>, handler: impl Fn(Vec<SchemaChangeResult>) + Send + 'static) {
        loop {
            self.flush.notified().await;
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            // A short grace period lets any event that arrived in the same
            // tick as the notification still land in this batch.
            tokio::time::sleep(Duration::from_millis(1)).await;
            let batch = self.drain().await;
            if !batch.is_empty() {
                handler(batch);
            }
        }
    }

    /// Stops the `run` loop (spec.md §5 "Client shutdown() aborts all
    /// Pools and the Control Connection"); wakes it immediately rather
    /// than waiting for the next schema event that may never come.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.flush.notify_one();
    }

    /// Waits up to `timeout` for the next flush to complete and returns
    /// the batch, used by tests rather than the `run` loop directly.
    #[cfg(test)]
    pub async fn next_batch(&self, timeout: Duration) -> Vec<SchemaChangeResult> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Vec::new();
            }
            let batch = self.drain().await;
            if !batch.is_empty() {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(keyspace: &str) -> SchemaChangeResult {
        SchemaChangeResult {
            change_type: "CREATED".into(),
            target: "KEYSPACE".into(),
            keyspace: keyspace.into(),
            object_name: None,
        }
    }

    #[tokio::test]
    async fn duplicate_keyspace_events_collapse_to_one() {
        let debouncer = EventDebouncer::new(Duration::from_millis(20));
        debouncer.queue(created("ks1"), false).await;
        debouncer.queue(created("ks1"), false).await;
        debouncer.queue(created("ks2"), false).await;
        let batch = debouncer.next_batch(Duration::from_millis(200)).await;
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn process_now_flushes_without_waiting_for_the_delay() {
        let debouncer = EventDebouncer::new(Duration::from_secs(60));
        debouncer.queue(created("ks1"), true).await;
        let batch = debouncer.next_batch(Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_run_loop() {
        let debouncer = EventDebouncer::new(Duration::from_millis(20));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let run_seen = Arc::clone(&seen);
        let run_task = tokio::spawn(Arc::clone(&debouncer).run(move |batch| {
            let run_seen = Arc::clone(&run_seen);
            tokio::spawn(async move {
                run_seen.lock().await.extend(batch);
            });
        }));

        debouncer.queue(created("ks1"), true).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.shutdown();

        tokio::time::timeout(Duration::from_millis(200), run_task)
            .await
            .expect("run loop should exit promptly after shutdown")
            .unwrap();
        assert_eq!(seen.lock().await.len(), 1);
    }
}
