//! Deduplicating, rate-limited work queue.
//!
//! The queue guarantees at most one in-flight instance per item identity:
//! while a key is pending or being processed, further adds coalesce into the
//! newest item instead of producing a second delivery. Failed items are
//! re-enqueued with per-key exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Items carried by a [`WorkQueue`]; the key is the deduplication identity.
pub trait QueueItem: Send + 'static {
    fn key(&self) -> String;
}

struct State<T> {
    /// FIFO of keys ready for pickup.
    order: VecDeque<String>,
    /// Newest item per key, for keys that are queued or parked behind an
    /// in-flight predecessor.
    pending: HashMap<String, T>,
    /// Keys currently handed out to a worker.
    processing: HashSet<String>,
    /// Consecutive failure count per key, drives the backoff.
    failures: HashMap<String, u32>,
    /// Keys for which a retry was requested since they were handed out.
    retrying: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new() -> Arc<Self> {
        Self::with_delays(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                pending: HashMap::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                retrying: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Enqueues an item. A key that is already pending keeps its queue
    /// position but carries the newest item; a key that is in flight is
    /// parked and re-queued when `done` is called for it.
    pub fn add(&self, item: T) {
        let key = item.key();
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return;
        }
        let was_pending = state.pending.insert(key.clone(), item).is_some();
        if was_pending || state.processing.contains(&key) {
            return;
        }
        state.order.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Blocks until an item is ready. Returns `None` once the queue has shut
    /// down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before checking state so an add between the
            // check and the await cannot be lost
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                while let Some(key) = state.order.pop_front() {
                    if let Some(item) = state.pending.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key finished. Re-queues it when it was re-added mid-flight and
    /// clears its backoff when no retry was requested.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if !state.retrying.remove(key) {
            state.failures.remove(key);
        }
        if state.pending.contains_key(key) {
            state.order.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-enqueues an item after its current backoff:
    /// `min(base · 2^failures, max)`.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let key = item.key();
        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let exponent = (*failures).min(20);
            *failures += 1;
            state.retrying.insert(key);
            self.base_delay
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.max_delay)
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Resets the backoff for a key.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.failures.remove(key);
        state.retrying.remove(key);
    }

    /// Idempotent; wakes all blocked `get` callers. Items still queued are
    /// drained before `get` reports shutdown.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    // virtual-clock aware; the backoff tests run under a paused runtime
    use tokio::time::Instant;

    #[derive(Clone, Debug, PartialEq)]
    struct TestItem {
        key: &'static str,
        version: u32,
    }

    impl QueueItem for TestItem {
        fn key(&self) -> String {
            self.key.to_string()
        }
    }

    fn item(key: &'static str, version: u32) -> TestItem {
        TestItem { key, version }
    }

    #[tokio::test]
    async fn test_get_returns_items_in_order() {
        let queue = WorkQueue::new();
        queue.add(item("a", 1));
        queue.add(item("b", 1));

        assert_eq!(queue.get().await.unwrap().key, "a");
        assert_eq!(queue.get().await.unwrap().key, "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_coalesces_pending_items_to_newest() {
        let queue = WorkQueue::new();
        queue.add(item("a", 1));
        queue.add(item("a", 2));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_add_while_processing_parks_until_done() {
        let queue = WorkQueue::new();
        queue.add(item("a", 1));

        let in_flight = queue.get().await.unwrap();
        queue.add(item("a", 2));
        // nothing ready while the predecessor is in flight
        assert!(queue.is_empty());

        queue.done(&in_flight.key());
        assert_eq!(queue.get().await.unwrap().version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_doubles_per_key() {
        let queue = WorkQueue::new();

        for expected_ms in [100u64, 200, 400] {
            let start = Instant::now();
            queue.add_rate_limited(item("a", 1));
            let retried = queue.get().await.unwrap();
            assert!(
                start.elapsed() >= Duration::from_millis(expected_ms),
                "retry arrived after {:?}, want >= {}ms",
                start.elapsed(),
                expected_ms
            );
            // keep the failure count: done() only clears it when no retry
            // was requested for the key
            queue.done(&retried.key());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_without_retry_resets_backoff() {
        let queue = WorkQueue::new();

        queue.add_rate_limited(item("a", 1));
        let first = queue.get().await.unwrap();
        queue.done(&first.key());

        queue.add(item("a", 2));
        let second = queue.get().await.unwrap();
        queue.done(&second.key());

        // the successful round above cleared the failure count
        let start = Instant::now();
        queue.add_rate_limited(item("a", 3));
        queue.get().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200), "backoff was not reset: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_resets_backoff() {
        let queue = WorkQueue::new();
        queue.add_rate_limited(item("a", 1));
        queue.get().await.unwrap();
        queue.forget("a");
        queue.done("a");

        let start = Instant::now();
        queue.add_rate_limited(item("a", 2));
        queue.get().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getters() {
        let queue: Arc<WorkQueue<TestItem>> = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_items_first() {
        let queue = WorkQueue::new();
        queue.add(item("a", 1));
        queue.shut_down();
        queue.shut_down(); // idempotent

        assert!(queue.get().await.is_some());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_dropped() {
        let queue = WorkQueue::new();
        queue.shut_down();
        queue.add(item("a", 1));
        assert!(queue.get().await.is_none());
    }
}
