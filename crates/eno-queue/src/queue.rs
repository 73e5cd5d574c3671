use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

struct Delayed<T> {
    at: Instant,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl<T> Eq for Delayed<T> {}
impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline.
        other.at.cmp(&self.at)
    }
}

struct Inner<T> {
    ready: VecDeque<T>,
    ready_set: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    delayed: BinaryHeap<Delayed<T>>,
    failures: HashMap<T, u32>,
    shutdown: bool,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Inner {
            ready: VecDeque::new(),
            ready_set: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            delayed: BinaryHeap::new(),
            failures: HashMap::new(),
            shutdown: false,
        }
    }
}

/// Deduplicating work queue with delayed adds and per-key exponential
/// backoff.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> Queue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_rate_limits(Duration::from_millis(5), Duration::from_secs(1000))
    }

    pub fn with_rate_limits(base_delay: Duration, max_delay: Duration) -> Self {
        Queue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue immediately. Already-queued keys are deduplicated; keys in
    /// flight are marked dirty and redelivered after `done`.
    pub fn add(&self, item: T) {
        {
            let mut inner = self.lock();
            if inner.shutdown {
                return;
            }
            Self::enqueue(&mut inner, item);
        }
        self.notify.notify_waiters();
    }

    fn enqueue(inner: &mut Inner<T>, item: T) {
        if inner.processing.contains(&item) {
            inner.dirty.insert(item);
            return;
        }
        if inner.ready_set.insert(item.clone()) {
            inner.ready.push_back(item);
        }
    }

    /// Enqueue after a delay. A zero delay is an immediate add.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        {
            let mut inner = self.lock();
            if inner.shutdown {
                return;
            }
            inner.delayed.push(Delayed {
                at: Instant::now() + delay,
                item,
            });
        }
        // Wake sleepers so they recompute their deadline.
        self.notify.notify_waiters();
    }

    /// Enqueue with this key's exponential backoff: base × 2^(failures),
    /// capped.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutdown {
                return;
            }
            let failures = inner.failures.entry(item.clone()).or_insert(0);
            let exp = (*failures).min(32);
            *failures += 1;
            let delay = self
                .base_delay
                .saturating_mul(2u32.saturating_pow(exp))
                .min(self.max_delay);
            trace!(failures = *failures, ?delay, "rate limited requeue");
            delay
        };
        self.add_after(item, delay);
    }

    /// Clear a key's failure history once it reconciles cleanly.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Next item, waiting as needed. `None` means the queue was shut down.
    /// The returned key is held out of the queue until `done` is called
    /// for it.
    pub async fn get(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.lock();
                if inner.shutdown {
                    return None;
                }
                Self::promote_due(&mut inner);
                if let Some(item) = inner.ready.pop_front() {
                    inner.ready_set.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
                inner.delayed.peek().map(|d| d.at)
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn promote_due(inner: &mut Inner<T>) {
        let now = Instant::now();
        while inner.delayed.peek().map_or(false, |d| d.at <= now) {
            if let Some(d) = inner.delayed.pop() {
                Self::enqueue(inner, d.item);
            }
        }
    }

    /// Mark a key's processing finished. If it was re-added in the
    /// meantime it goes straight back on the queue.
    pub fn done(&self, item: &T) {
        let redeliver = {
            let mut inner = self.lock();
            inner.processing.remove(item);
            if inner.dirty.remove(item) {
                Self::enqueue(&mut inner, item.clone());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.notify.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.ready.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

impl<T> Default for Queue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn add_and_get() {
        let q = Queue::new();
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
    }

    #[tokio::test]
    async fn duplicate_adds_deliver_once() {
        let q = Queue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_keys_are_not_handed_out_twice() {
        let q = Queue::new();
        q.add("a");
        let got = q.get().await.unwrap();

        // Re-added while processing: not visible yet.
        q.add("a");
        assert!(q.is_empty());

        // done() redelivers exactly once.
        q.done(&got);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_adds_surface_after_their_deadline() {
        let q = Arc::new(Queue::new());
        q.add_after("later", Duration::from_secs(5));
        assert_eq!(q.len(), 1);

        let start = Instant::now();
        let got = q.get().await.unwrap();
        assert_eq!(got, "later");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins() {
        let q = Queue::new();
        q.add_after("slow", Duration::from_secs(10));
        q.add_after("fast", Duration::from_secs(1));
        assert_eq!(q.get().await, Some("fast"));
        q.done(&"fast");
        assert_eq!(q.get().await, Some("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_backoff_grows_and_forget_resets() {
        let q = Queue::with_rate_limits(Duration::from_millis(10), Duration::from_secs(60));

        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 1);
        let start = Instant::now();
        q.get().await.unwrap();
        let first = start.elapsed();
        assert!(first >= Duration::from_millis(10));
        q.done(&"a");

        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        let start = Instant::now();
        q.get().await.unwrap();
        // Second failure: 10ms × 2.
        assert!(start.elapsed() >= Duration::from_millis(20));
        q.done(&"a");

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let q = Queue::with_rate_limits(Duration::from_millis(10), Duration::from_millis(50));
        for _ in 0..20 {
            q.add_rate_limited("a");
            let start = Instant::now();
            q.get().await.unwrap();
            assert!(start.elapsed() <= Duration::from_millis(60));
            q.done(&"a");
        }
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = Arc::new(Queue::<&'static str>::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        // Give the waiter a chance to block.
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        // Adds after shutdown are dropped.
        q.add("a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn concurrent_workers_split_the_queue() {
        let q = Arc::new(Queue::new());
        for i in 0..100 {
            q.add(i);
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = q.get().await {
                    seen.push(item);
                    q.done(&item);
                }
                seen
            }));
        }
        // Let the workers drain, then stop them.
        while !q.is_empty() {
            tokio::task::yield_now().await;
        }
        q.shut_down();

        let mut all: Vec<i32> = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
