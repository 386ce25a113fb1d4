//! In-process rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::counter::CounterEntry;
use super::policy::{RateLimitConfig, RateLimitResult};
use crate::error::Result;

/// Default cap on the number of tracked identifiers.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// A full store frees `max_entries / EVICTION_BATCH_DIVISOR` slots at once.
const EVICTION_BATCH_DIVISOR: usize = 16;

/// Fixed-window rate limiter holding its counters in process memory.
///
/// Each instance owns its own counters, so tests and independently
/// configured gates never share state by accident. The read-check-increment
/// for a key happens under that key's shard lock, which keeps the number of
/// admitted requests per window at or below the budget under any amount of
/// concurrency.
///
/// Expired windows are replaced lazily on access. Total memory is bounded by
/// `max_entries`: when a new key arrives at capacity, expired entries are
/// dropped first and, failing that, the entries whose windows end soonest are
/// evicted in a batch of `max_entries / 16`. A flood of fresh keys therefore
/// costs amortized O(1) per request rather than a full scan each.
/// [`InMemoryRateLimiter::spawn_sweeper`] adds a periodic cleanup on top.
pub struct InMemoryRateLimiter {
    /// Counters keyed by caller-composed identifier
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    /// Held by the caller running an eviction pass
    eviction: Mutex<()>,
}

impl InMemoryRateLimiter {
    /// Create a limiter on the system clock with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Arc::new(SystemClock::new()), DEFAULT_MAX_ENTRIES)
    }

    /// Create a limiter driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_MAX_ENTRIES)
    }

    /// Create a limiter with an explicit clock and key capacity.
    pub fn with_capacity(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entries: max_entries.max(1),
            eviction: Mutex::new(()),
        }
    }

    /// Count one request against `identifier`.
    pub fn check_now(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let now = self.clock.now_millis();

        if !self.entries.contains_key(identifier) {
            self.make_room(now);
        }

        // The entry guard holds the shard write lock until the end of the match.
        let result = match self.entries.entry(identifier.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CounterEntry::open(now, config);
                    entry.opened_result(config)
                } else {
                    entry.admit(config)
                }
            }
            Entry::Vacant(vacant) => {
                let entry = CounterEntry::open(now, config);
                let result = entry.opened_result(config);
                vacant.insert(entry);
                result
            }
        };

        trace!(
            identifier = %identifier,
            success = result.success,
            remaining = result.remaining,
            reset = result.reset,
            "Checked in-process rate limit"
        );

        if !result.success {
            debug!(
                identifier = %identifier,
                limit = config.max_requests(),
                reset = result.reset,
                "Rate limit exceeded"
            );
        }

        result
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(self.clock.now_millis())
    }

    fn sweep_expired_at(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Free room for new keys if the store is full.
    ///
    /// One pass drops every expired entry and, if that is not enough, the
    /// live entries with the soonest resets until the store is a batch below
    /// capacity. The next `max_entries / EVICTION_BATCH_DIVISOR` new keys then
    /// insert without scanning, so the O(n) pass is paid once per batch.
    /// Only one caller runs the pass; concurrent new keys insert while it is
    /// in progress, so the cap is soft by the number of racing inserts.
    ///
    /// Must not be called while holding an entry guard.
    fn make_room(&self, now: i64) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let Some(_pass) = self.eviction.try_lock() else {
            return;
        };
        // A pass that just finished may already have freed room.
        if self.entries.len() < self.max_entries {
            return;
        }

        let target = self.max_entries - self.eviction_batch();
        let swept = self.sweep_expired_at(now);
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            debug!(swept, "Swept expired counters to make room");
            return;
        }

        let evicted = self.evict_soonest(excess);
        warn!(
            swept,
            evicted,
            max_entries = self.max_entries,
            "Rate limiter at capacity, evicted live counters"
        );
    }

    /// Number of slots freed by one eviction pass.
    fn eviction_batch(&self) -> usize {
        (self.max_entries / EVICTION_BATCH_DIVISOR).max(1)
    }

    /// Remove the `count` entries whose windows end soonest.
    fn evict_soonest(&self, count: usize) -> usize {
        let mut resets: Vec<i64> = self.entries.iter().map(|entry| entry.reset_at).collect();
        if resets.is_empty() || count == 0 {
            return 0;
        }
        let count = count.min(resets.len());
        let (below, threshold, _) = resets.select_nth_unstable(count - 1);
        let threshold = *threshold;
        // Entries tied with the threshold are evicted only up to `count`.
        let mut ties = count - below.iter().filter(|&&reset| reset < threshold).count();

        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if entry.reset_at < threshold {
                false
            } else if entry.reset_at == threshold && ties > 0 {
                ties -= 1;
                false
            } else {
                true
            }
        });
        before.saturating_sub(self.entries.len())
    }

    /// Start a background task that sweeps expired entries every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = limiter.counter_count(), "Swept expired counters");
                }
            }
        })
    }

    /// Current entry for an identifier, expired or not.
    pub fn get(&self, identifier: &str) -> Option<CounterEntry> {
        self.entries.get(identifier).map(|entry| *entry.value())
    }

    /// Current request count for an identifier.
    pub fn get_count(&self, identifier: &str) -> Option<u64> {
        self.get(identifier).map(|entry| entry.count)
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Get the number of tracked identifiers.
    pub fn counter_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for InMemoryRateLimiter {
    async fn check(&self, identifier: &str, config: &RateLimitConfig) -> Result<RateLimitResult> {
        Ok(self.check_now(identifier, config))
    }

    fn name(&self) -> &'static str {
        "inmem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    const START: i64 = 1_700_000_000_000;

    fn limiter_at(start: i64) -> (InMemoryRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (InMemoryRateLimiter::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = InMemoryRateLimiter::new();
        assert_eq!(limiter.counter_count(), 0);
    }

    #[test]
    fn test_sequential_budget() {
        let (limiter, _clock) = limiter_at(START);
        let config = RateLimitConfig::new(3, 60_000).unwrap();

        let remaining: Vec<u64> = (0..3)
            .map(|_| {
                let result = limiter.check_now("k", &config);
                assert!(result.success);
                assert_eq!(result.reset, START + 60_000);
                result.remaining
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let fourth = limiter.check_now("k", &config);
        assert!(!fourth.success);
        assert_eq!(fourth.remaining, 0);
        assert_eq!(fourth.reset, START + 60_000);
    }

    #[test]
    fn test_denied_calls_do_not_mutate() {
        let (limiter, _clock) = limiter_at(START);
        let config = RateLimitConfig::new(2, 1_000).unwrap();

        limiter.check_now("k", &config);
        limiter.check_now("k", &config);
        let before = limiter.get("k").unwrap();

        for _ in 0..5 {
            assert!(!limiter.check_now("k", &config).success);
        }

        assert_eq!(limiter.get("k").unwrap(), before);
        assert_eq!(limiter.get_count("k"), Some(2));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let (limiter, clock) = limiter_at(START);
        let config = RateLimitConfig::new(1, 1_000).unwrap();

        assert!(limiter.check_now("k", &config).success);
        assert!(!limiter.check_now("k", &config).success);

        // Still inside the window at exactly reset_at.
        clock.advance(1_000);
        assert!(!limiter.check_now("k", &config).success);

        clock.advance(1);
        let result = limiter.check_now("k", &config);
        assert!(result.success);
        assert_eq!(result.reset, START + 1_001 + 1_000);
        assert_eq!(limiter.get_count("k"), Some(1));
    }

    #[test]
    fn test_different_identifiers_have_separate_counters() {
        let (limiter, _clock) = limiter_at(START);
        let config = RateLimitConfig::new(1, 1_000).unwrap();

        assert!(limiter.check_now("1.2.3.4:newsletter", &config).success);
        assert!(limiter.check_now("1.2.3.4:bookmarks", &config).success);
        assert!(limiter.check_now("5.6.7.8:newsletter", &config).success);
        assert_eq!(limiter.counter_count(), 3);
    }

    #[test]
    fn test_clear_counters() {
        let (limiter, _clock) = limiter_at(START);
        let config = RateLimitConfig::new(1, 1_000).unwrap();

        limiter.check_now("k", &config);
        assert_eq!(limiter.counter_count(), 1);

        limiter.clear();
        assert_eq!(limiter.counter_count(), 0);
        assert!(limiter.check_now("k", &config).success);
    }

    #[test]
    fn test_sweep_expired() {
        let (limiter, clock) = limiter_at(START);
        let short = RateLimitConfig::new(5, 100).unwrap();
        let long = RateLimitConfig::new(5, 10_000).unwrap();

        limiter.check_now("short", &short);
        limiter.check_now("long", &long);

        clock.advance(101);
        assert_eq!(limiter.sweep_expired(), 1);
        assert!(limiter.get("short").is_none());
        assert!(limiter.get("long").is_some());
    }

    #[test]
    fn test_capacity_prefers_expired_entries() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = InMemoryRateLimiter::with_capacity(clock.clone(), 2);
        let short = RateLimitConfig::new(5, 100).unwrap();
        let long = RateLimitConfig::new(5, 10_000).unwrap();

        limiter.check_now("a", &long);
        limiter.check_now("b", &short);
        clock.advance(200);

        limiter.check_now("c", &long);
        assert_eq!(limiter.counter_count(), 2);
        assert!(limiter.get("a").is_some());
        assert!(limiter.get("b").is_none());
    }

    #[test]
    fn test_capacity_evicts_soonest_reset() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = InMemoryRateLimiter::with_capacity(clock.clone(), 2);
        let config = RateLimitConfig::new(5, 1_000).unwrap();

        limiter.check_now("first", &config);
        clock.advance(10);
        limiter.check_now("second", &config);
        clock.advance(10);
        limiter.check_now("third", &config);

        assert_eq!(limiter.counter_count(), 2);
        assert!(limiter.get("first").is_none());
        assert!(limiter.get("second").is_some());
        assert!(limiter.get("third").is_some());
    }

    #[test]
    fn test_full_store_evicts_in_batches() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = InMemoryRateLimiter::with_capacity(clock.clone(), 160);
        let config = RateLimitConfig::new(5, 60_000).unwrap();
        let batch = limiter.eviction_batch();
        assert_eq!(batch, 10);

        for i in 0..160 {
            limiter.check_now(&format!("old-{}", i), &config);
            clock.advance(1);
        }
        assert_eq!(limiter.counter_count(), 160);

        // The first new key at capacity frees a whole batch of the oldest windows.
        limiter.check_now("new-0", &config);
        assert_eq!(limiter.counter_count(), 160 - batch + 1);
        assert!((0..batch).all(|i| limiter.get(&format!("old-{}", i)).is_none()));

        // The rest of the batch inserts without evicting anything.
        for i in 1..batch {
            limiter.check_now(&format!("new-{}", i), &config);
        }
        assert_eq!(limiter.counter_count(), 160);
        assert!(limiter.get(&format!("old-{}", batch)).is_some());

        // The next new key starts another pass.
        limiter.check_now("new-next", &config);
        assert!(limiter.get(&format!("old-{}", batch)).is_none());
        assert!(limiter.get(&format!("new-{}", batch - 1)).is_some());
    }

    #[test]
    fn test_eviction_with_tied_resets_stops_at_batch() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = InMemoryRateLimiter::with_capacity(clock, 32);
        let config = RateLimitConfig::new(5, 60_000).unwrap();

        for i in 0..32 {
            limiter.check_now(&format!("k-{}", i), &config);
        }
        limiter.check_now("fresh", &config);

        assert_eq!(limiter.counter_count(), 32 - limiter.eviction_batch() + 1);
        assert!(limiter.get("fresh").is_some());
    }

    #[test]
    fn test_widest_window_still_denies() {
        let (limiter, _clock) = limiter_at(START);
        let config = RateLimitConfig::new(1, i64::MAX as u64).unwrap();

        let first = limiter.check_now("k", &config);
        assert!(first.success);
        assert_eq!(first.reset, i64::MAX);
        assert!(!limiter.check_now("k", &config).success);
        assert!(!limiter.check_now("k", &config).success);
    }

    #[test]
    fn test_existing_key_at_capacity_is_not_evicted() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = InMemoryRateLimiter::with_capacity(clock, 1);
        let config = RateLimitConfig::new(5, 1_000).unwrap();

        limiter.check_now("only", &config);
        limiter.check_now("only", &config);
        assert_eq!(limiter.get_count("only"), Some(2));
    }

    #[test]
    fn test_concurrent_threads_never_exceed_budget() {
        let limiter = InMemoryRateLimiter::new();
        let config = RateLimitConfig::new(3, 60_000).unwrap();
        let threads = 10;
        let barrier = Barrier::new(threads);
        let successes = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    if limiter.check_now("fresh", &config).success {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.get_count("fresh"), Some(3));
    }

    #[test]
    fn test_heavy_contention_never_exceeds_budget() {
        let limiter = InMemoryRateLimiter::new();
        let config = RateLimitConfig::new(50, 60_000).unwrap();
        let threads = 16;
        let per_thread = 25;
        let barrier = Barrier::new(threads);
        let successes = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..per_thread {
                        if limiter.check_now("hot", &config).success {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_never_exceed_budget() {
        let limiter = Arc::new(InMemoryRateLimiter::new());
        let config = RateLimitConfig::new(3, 60_000).unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("fresh", &config).await })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let allowed = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|result| result.success)
            .count();

        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(InMemoryRateLimiter::with_clock(clock.clone()));
        let config = RateLimitConfig::new(5, 100).unwrap();

        limiter.check_now("k", &config);
        clock.advance(500);

        let handle = limiter.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(limiter.counter_count(), 0);
    }
}
