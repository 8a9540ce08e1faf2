//! De-duplicating, rate-limiting work queue
//!
//! Semantics follow the usual controller work queue:
//! - An item added while already queued is collapsed into the queued entry
//! - An item added while being processed is queued again once `done` is
//!   called for it, so it is never handed to two workers at once
//! - `get` blocks until an item is available and returns `None` after
//!   `shut_down`

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Default base delay for per-item exponential backoff
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap for per-item exponential backoff
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

pub struct RateLimitingQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> Default for RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Create a queue with custom exponential backoff bounds
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark an item as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Add an item once `delay` has passed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add an item after its per-item exponential backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.when(&item);
        self.add_after(item, delay);
    }

    /// Backoff delay for the next retry of `item`, recording the failure
    fn when(&self, item: &T) -> Duration {
        let mut state = self.state();
        let failures = state.failures.entry(item.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Stop tracking failures for an item
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// Number of rate-limited retries recorded for an item
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Block until an item is available. Returns `None` once the queue is
    /// shutting down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark an item returned by `get` as finished
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake every blocked `get`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates_queued_items() {
        let queue = RateLimitingQueue::new();
        queue.add("agent-a".to_string());
        queue.add("agent-a".to_string());
        queue.add("agent-b".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("agent-a"));
        assert_eq!(queue.get().await.as_deref(), Some("agent-b"));
    }

    #[tokio::test]
    async fn test_add_during_processing_requeues_after_done() {
        let queue = RateLimitingQueue::new();
        queue.add("agent".to_string());

        let item = queue.get().await.unwrap();
        queue.add("agent".to_string());
        // Not handed out again while still processing
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("agent"));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_get() {
        let queue: Arc<RateLimitingQueue<String>> = Arc::new(RateLimitingQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get should return after shutdown")
            .unwrap();
        assert!(result.is_none());

        queue.add("late".to_string());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_after_delays_item() {
        let queue: Arc<RateLimitingQueue<String>> = Arc::new(RateLimitingQueue::new());
        queue.add_after("agent".to_string(), Duration::from_millis(50));
        assert!(queue.is_empty());

        let item = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(item.as_deref(), Some("agent"));
    }

    #[test]
    fn test_exponential_backoff_and_forget() {
        let queue: RateLimitingQueue<String> =
            RateLimitingQueue::with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        let key = "agent".to_string();

        assert_eq!(queue.when(&key), Duration::from_millis(10));
        assert_eq!(queue.when(&key), Duration::from_millis(20));
        assert_eq!(queue.when(&key), Duration::from_millis(40));
        assert_eq!(queue.when(&key), Duration::from_millis(50));
        assert_eq!(queue.num_requeues(&key), 4);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
        assert_eq!(queue.when(&key), Duration::from_millis(10));
    }
}
