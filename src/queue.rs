//! Deduplicating, rate-limited work queue.
//!
//! A key is in at most one of three places: queued (waiting for a worker),
//! processing (handed out by [`WorkQueue::get`] and not yet [`WorkQueue::done`]),
//! or nowhere. Adding a key that is already queued is a no-op. Adding a key
//! that is being processed marks it dirty, and it is queued again once the
//! worker calls `done`, so a key is never reconciled by two workers at once.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::Notify;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Per-item exponential failure backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        // Critical sections never panic half-way, so the state is consistent
        // even if a holder panicked.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already pending.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Picked up again by `done`
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed. Must be called within a tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after a delay that grows with every failure recorded for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.when(&key);
        self.add_after(key, delay);
    }

    /// Record one more failure for `key` and return the delay before its next attempt.
    pub fn when(&self, key: &K) -> Duration {
        let mut state = self.state();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let delay = self.inner.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue has been shut down.
    ///
    /// The returned key is owned by the caller until it is passed to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a wakeup between the
            // check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as processed. If it was added again meanwhile, it is queued now.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys. Every pending and future `get` returns `None`.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(5));
        assert_eq!(backoff.delay(64), Duration::from_secs(5));
    }

    #[test]
    fn test_failures_grow_and_reset() {
        let queue = queue();
        assert_eq!(queue.when(&"default/a"), Duration::from_millis(20));
        assert_eq!(queue.when(&"default/a"), Duration::from_millis(40));
        assert_eq!(queue.when(&"default/a"), Duration::from_millis(80));
        assert_eq!(queue.when(&"default/a"), Duration::from_millis(100));
        assert_eq!(queue.num_requeues(&"default/a"), 4);
        assert_eq!(queue.num_requeues(&"default/b"), 0);

        queue.forget(&"default/a");
        assert_eq!(queue.num_requeues(&"default/a"), 0);
        assert_eq!(queue.when(&"default/a"), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = queue();
        queue.add("default/a");
        queue.add("default/a");
        queue.add("default/b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("default/a"));
        assert_eq!(queue.get().await, Some("default/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_deferred() {
        let queue = queue();
        queue.add("default/a");
        let key = queue.get().await.unwrap();

        queue.add("default/a");
        queue.add("default/a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("default/a"));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("default/a");
        assert_eq!(waiter.await.unwrap(), Some("default/a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }

        queue.add("default/a");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_add_rate_limited_waits_for_backoff() {
        let queue = queue();
        let start = Instant::now();
        queue.add_rate_limited("default/a");
        assert!(queue.is_empty());

        assert_eq!(queue.get().await, Some("default/a"));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(queue.num_requeues(&"default/a"), 1);
    }
}
