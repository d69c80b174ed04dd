//! Deduplicating, rate-limited work queue feeding the reconcile workers.
//!
//! The queue guarantees that a given item is handed to at most one worker at
//! a time: re-adding an item that is dirty coalesces, re-adding one that is
//! in flight parks it until [`WorkQueue::done`]. Failed items come back
//! through [`WorkQueue::add_rate_limited`], which delays them by the maximum
//! of a per-item exponential backoff and a global token bucket; both
//! limiters matter, one spreads out a single hot item, the other caps the
//! aggregate requeue rate across items.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use log::trace;

pub(crate) mod constants {
    use std::time::Duration;

    /// First retry delay of the per-item backoff.
    pub(crate) const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Ceiling of the per-item backoff.
    pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);

    /// Sustained requeue rate of the global token bucket, per second.
    pub(crate) const OVERALL_RATE: f64 = 10.0;

    /// Burst capacity of the global token bucket.
    pub(crate) const OVERALL_BURST: f64 = 100.0;
}

/// Per-item exponential backoff: the delay doubles on every requeue of the
/// same item until the item is forgotten.
#[derive(Debug)]
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    cap: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: Clone + Eq + Hash> ItemExponentialBackoff<T> {
    /// Creates a backoff starting at `base` and capped at `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the delay for the next requeue of `item` and records the
    /// failure.
    pub fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap();
        let attempts = failures.entry(item.clone()).or_insert(0);
        let exponent = *attempts;
        *attempts += 1;

        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        let _ = self.failures.lock().unwrap().remove(item);
    }

    /// Returns how often `item` has been requeued since it was last
    /// forgotten.
    pub fn retries(&self, item: &T) -> u32 {
        self.failures.lock().unwrap().get(item).copied().unwrap_or(0)
    }
}

/// Global token bucket limiting the aggregate requeue rate.
///
/// Callers reserve a token even when none is available; the returned delay
/// tells them when their reservation comes up, so a thundering herd is
/// spread out instead of dropped.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket refilling at `rate` tokens per second with the given
    /// burst capacity. Starts full.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Reserves one token and returns how long to wait for it.
    pub fn when(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }
}

/// The queue's rate limiter: max-of over the per-item backoff and the global
/// bucket.
#[derive(Debug)]
pub struct RateLimiter<T> {
    per_item: ItemExponentialBackoff<T>,
    overall: TokenBucket,
}

impl<T: Clone + Eq + Hash> RateLimiter<T> {
    /// Composes a limiter from its two halves.
    pub fn new(per_item: ItemExponentialBackoff<T>, overall: TokenBucket) -> Self {
        Self { per_item, overall }
    }

    /// The limiter used for reconcile retries: 1 s doubling to 1000 s per
    /// item, 10 requeues per second overall with a burst of 100.
    pub fn controller() -> Self {
        Self::new(
            ItemExponentialBackoff::new(constants::BASE_RETRY_DELAY, constants::MAX_RETRY_DELAY),
            TokenBucket::new(constants::OVERALL_RATE, constants::OVERALL_BURST),
        )
    }

    /// Returns the delay before `item` may be requeued.
    pub fn when(&self, item: &T) -> Duration {
        self.per_item.when(item).max(self.overall.when())
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.per_item.forget(item);
    }

    /// Returns how often `item` has been requeued.
    pub fn retries(&self, item: &T) -> u32 {
        self.per_item.retries(item)
    }
}

impl<T: Clone + Eq + Hash> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::controller()
    }
}

#[derive(Debug)]
struct DelayedItem<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

// Ordering is reversed so the max-heap surfaces the earliest deadline.
impl<T> PartialEq for DelayedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for DelayedItem<T> {}

impl<T> PartialOrd for DelayedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    delayed: BinaryHeap<DelayedItem<T>>,
    next_seq: u64,
    shut_down: bool,
}

/// A blocking work queue with dedup, delayed re-adds and rate limiting.
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    wakeup: Condvar,
    limiter: RateLimiter<T>,
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    /// Creates a queue using the given limiter for
    /// [`WorkQueue::add_rate_limited`].
    pub fn new(limiter: RateLimiter<T>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                next_seq: 0,
                shut_down: false,
            }),
            wakeup: Condvar::new(),
            limiter,
        }
    }

    fn enqueue(state: &mut QueueState<T>, item: T) {
        if state.shut_down || state.dirty.contains(&item) {
            return;
        }
        let _ = state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // parked; done() re-queues it
            return;
        }
        state.queue.push_back(item);
    }

    /// Adds an item, deduplicating against pending and in-flight copies.
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock().unwrap();
            Self::enqueue(&mut state, item);
        }
        self.wakeup.notify_one();
    }

    /// Adds an item once `delay` has passed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.delayed.push(DelayedItem {
                ready_at: Instant::now() + delay,
                seq,
                item,
            });
        }
        // a sleeping get() must recompute its wait deadline
        self.wakeup.notify_one();
    }

    /// Re-adds a failed item after the limiter's delay.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        trace!("requeuing after {delay:?}");
        self.add_after(item, delay);
    }

    /// Clears the limiter's failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    /// Returns how often `item` has been requeued.
    pub fn retries(&self, item: &T) -> u32 {
        self.limiter.retries(item)
    }

    /// Blocks until an item is available and leases it to the caller.
    ///
    /// Returns `None` once the queue was shut down and drained. The caller
    /// must pair every lease with a [`WorkQueue::done`].
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = Instant::now();
            while state
                .delayed
                .peek()
                .is_some_and(|delayed| delayed.ready_at <= now)
            {
                let delayed = state.delayed.pop().unwrap();
                Self::enqueue(&mut state, delayed.item);
            }

            if let Some(item) = state.queue.pop_front() {
                let _ = state.dirty.remove(&item);
                let _ = state.processing.insert(item.clone());
                return Some(item);
            }
            if state.shut_down {
                return None;
            }

            state = match state.delayed.peek().map(|delayed| delayed.ready_at) {
                Some(ready_at) => {
                    self.wakeup
                        .wait_timeout(state, ready_at.saturating_duration_since(now))
                        .unwrap()
                        .0
                }
                None => self.wakeup.wait(state).unwrap(),
            };
        }
    }

    /// Returns a lease. If the item was re-added while in flight it goes
    /// back on the queue now.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.state.lock().unwrap();
            let _ = state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.wakeup.notify_one();
        }
    }

    /// Shuts the queue: pending items are still handed out, then every
    /// blocked and future [`WorkQueue::get`] returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shut_down = true;
        }
        self.wakeup.notify_all();
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Whether no items are waiting to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new(RateLimiter::controller())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn adding_twice_hands_out_once() {
        let queue: WorkQueue<&str> = WorkQueue::default();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get(), Some("a"));
        assert_eq!(queue.get(), Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn re_adding_an_in_flight_item_parks_it_until_done() {
        let queue: WorkQueue<&str> = WorkQueue::default();
        queue.add("a");

        let leased = queue.get().unwrap();
        queue.add("a");
        assert!(queue.is_empty(), "in-flight item must not be handed out twice");

        queue.done(&leased);
        assert_eq!(queue.get(), Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[test]
    fn shut_down_drains_and_unblocks() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::default());
        queue.add("a");
        queue.shut_down();

        // pending items still come out, then the queue reports shutdown
        assert_eq!(queue.get(), Some("a"));
        queue.done(&"a");
        assert_eq!(queue.get(), None);

        // a blocked getter wakes up on shutdown
        let queue2: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::default());
        let getter = {
            let queue2 = Arc::clone(&queue2);
            std::thread::spawn(move || queue2.get())
        };
        std::thread::sleep(Duration::from_millis(50));
        queue2.shut_down();
        assert_eq!(getter.join().unwrap(), None);
    }

    #[test]
    fn adds_after_a_shutdown_are_dropped() {
        let queue: WorkQueue<&str> = WorkQueue::default();
        queue.shut_down();
        queue.add("a");
        queue.add_after("b", Duration::from_millis(1));
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn delayed_items_surface_after_their_delay() {
        let queue: WorkQueue<&str> = WorkQueue::default();
        queue.add_after("later", Duration::from_millis(30));
        queue.add("now");

        assert_eq!(queue.get(), Some("now"));
        queue.done(&"now");

        let started = Instant::now();
        assert_eq!(queue.get(), Some("later"));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn per_item_backoff_doubles_and_caps() {
        let backoff = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.when(&"a"), Duration::from_secs(1));
        assert_eq!(backoff.when(&"a"), Duration::from_secs(2));
        assert_eq!(backoff.when(&"a"), Duration::from_secs(4));
        assert_eq!(backoff.when(&"a"), Duration::from_secs(5));
        assert_eq!(backoff.when(&"a"), Duration::from_secs(5));
        assert_eq!(backoff.retries(&"a"), 5);

        // an unrelated item starts fresh
        assert_eq!(backoff.when(&"b"), Duration::from_secs(1));

        backoff.forget(&"a");
        assert_eq!(backoff.retries(&"a"), 0);
        assert_eq!(backoff.when(&"a"), Duration::from_secs(1));
    }

    #[test]
    fn token_bucket_delays_once_the_burst_is_spent() {
        let bucket = TokenBucket::new(10.0, 2.0);
        assert_eq!(bucket.when(), Duration::ZERO);
        assert_eq!(bucket.when(), Duration::ZERO);

        let third = bucket.when();
        assert!(third > Duration::ZERO);
        assert!(third <= Duration::from_millis(100));

        // reservations queue up behind each other
        let fourth = bucket.when();
        assert!(fourth > third);
    }

    #[test]
    fn limiter_takes_the_maximum_of_both_halves() {
        let limiter = RateLimiter::new(
            ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(1000)),
            TokenBucket::new(10.0, 100.0),
        );
        // bucket is full, so the per-item backoff dominates
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(2));
    }
}
