//! The sliding log admission algorithm.
//!
//! Every admitted request is remembered by its timestamp. A request is admitted when fewer than
//! `capacity` admitted requests fall within the trailing `window` ending at the current time.
//! Unlike a fixed window there is no burst at window boundaries, and unlike a token bucket
//! unused capacity is never saved up.

use crate::backend::clock::Timestamp;
use crate::backend::store::{RateLimitStore, RequestLog};
use crate::backend::Decision;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// State of a client's window immediately after an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Maximum admitted requests within the window.
    pub limit: u64,
    /// Requests that may still be admitted right now.
    pub remaining: u64,
    /// Time until a request would be admitted: zero while a slot is free, otherwise until the
    /// oldest admitted request leaves the window.
    pub reset: Duration,
}

/// Sliding log rate limiter; the sole owner of its [RateLimitStore].
#[derive(Debug, Default)]
pub struct SlidingWindow {
    store: RateLimitStore,
    // Largest window any check has used, so the idle sweep never evicts a live log.
    max_window_ms: AtomicU64,
}

/// The first timestamp that is still inside a window of `window_ms` ending at `now`.
///
/// An entry `t` is live when `now - t < window_ms`.
pub fn window_start(now: Timestamp, window_ms: u64) -> Timestamp {
    now.saturating_add(1).saturating_sub(window_ms)
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether to admit a request for `key` at `now`.
    ///
    /// The client's log is pruned, and `now` is only recorded if the request is admitted, so
    /// rejected requests never take up space in the window.
    ///
    /// Runs atomically with respect to other calls for the same `key`.
    pub fn check_and_record(
        &self,
        key: &str,
        now: Timestamp,
        capacity: u64,
        window_ms: u64,
    ) -> (Decision, WindowState) {
        self.max_window_ms.fetch_max(window_ms, Ordering::Relaxed);
        let start = window_start(now, window_ms);
        self.store.update(key, |log| {
            log.prune(start);
            let admitted = (log.len() as u64) < capacity;
            if admitted {
                log.record(now);
            }
            let state = WindowState {
                limit: capacity,
                remaining: capacity.saturating_sub(log.len() as u64),
                reset: reset_after(log, now, capacity, window_ms),
            };
            (Decision::from_admitted(admitted), state)
        })
    }

    /// Removes a previously admitted request from the window of `key`.
    ///
    /// Returns false if the entry was no longer present (e.g. it had already expired).
    pub fn rollback(&self, key: &str, timestamp: Timestamp) -> bool {
        self.store
            .update_existing(key, |log| log.remove(timestamp))
            .unwrap_or(false)
    }

    /// Forgets all history for `key`.
    pub fn remove_key(&self, key: &str) {
        self.store.remove(key);
    }

    /// Evicts every client whose newest admitted request has left the largest window in use.
    ///
    /// Returns the number of evicted keys.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let start = window_start(now, self.max_window_ms.load(Ordering::Relaxed));
        let before = self.store.len();
        self.store
            .retain(|_, log| log.newest().map(|newest| newest >= start).unwrap_or(false));
        before.saturating_sub(self.store.len())
    }

    pub fn store(&self) -> &RateLimitStore {
        &self.store
    }
}

fn reset_after(log: &RequestLog, now: Timestamp, capacity: u64, window_ms: u64) -> Duration {
    if (log.len() as u64) < capacity {
        return Duration::ZERO;
    }
    let millis = log
        .oldest()
        .map(|oldest| oldest.saturating_add(window_ms).saturating_sub(now))
        .unwrap_or(0);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1000;

    fn admit(limiter: &SlidingWindow, key: &str, now: Timestamp, capacity: u64, window: u64) -> bool {
        limiter
            .check_and_record(key, now, capacity, window)
            .0
            .is_admitted()
    }

    #[test]
    fn test_window_start() {
        assert_eq!(window_start(1000, 1000), 1);
        assert_eq!(window_start(500, 1000), 0);
        assert_eq!(window_start(500, 0), 501);
    }

    #[test]
    fn test_capacity_then_reject() {
        let limiter = SlidingWindow::new();
        for capacity in 1..5u64 {
            let key = format!("KEY{capacity}");
            for i in 0..capacity {
                assert!(admit(&limiter, &key, i, capacity, SECOND));
            }
            assert!(!admit(&limiter, &key, capacity, capacity, SECOND));
        }
    }

    #[test]
    fn test_scenario() {
        let limiter = SlidingWindow::new();
        assert!(admit(&limiter, "KEY1", 0, 2, SECOND));
        assert!(admit(&limiter, "KEY1", 100, 2, SECOND));
        assert!(!admit(&limiter, "KEY1", 200, 2, SECOND));
        // The request at t=0 has left the window
        assert!(admit(&limiter, "KEY1", 1001, 2, SECOND));
        // But the one at t=100 has not
        assert!(!admit(&limiter, "KEY1", 1050, 2, SECOND));
    }

    #[test]
    fn test_admits_exactly_one_window_later() {
        let limiter = SlidingWindow::new();
        assert!(admit(&limiter, "KEY1", 0, 1, SECOND));
        assert!(!admit(&limiter, "KEY1", 999, 1, SECOND));
        assert!(admit(&limiter, "KEY1", 1000, 1, SECOND));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindow::new();
        assert!(admit(&limiter, "KEY1", 0, 1, SECOND));
        assert!(!admit(&limiter, "KEY1", 1, 1, SECOND));
        assert!(admit(&limiter, "KEY2", 1, 1, SECOND));
    }

    #[test]
    fn test_rejections_do_not_consume_capacity() {
        let limiter = SlidingWindow::new();
        assert!(admit(&limiter, "KEY1", 0, 1, SECOND));
        for t in 1..100 {
            assert!(!admit(&limiter, "KEY1", t * 5, 1, SECOND));
        }
        assert_eq!(limiter.store().get_log("KEY1").len(), 1);
        assert!(admit(&limiter, "KEY1", SECOND, 1, SECOND));
    }

    #[test]
    fn test_zero_capacity_always_rejects() {
        let limiter = SlidingWindow::new();
        for t in 0..10 {
            assert!(!admit(&limiter, "KEY1", t * SECOND * 10, 0, SECOND));
        }
    }

    #[test]
    fn test_zero_window_always_admits() {
        let limiter = SlidingWindow::new();
        for _ in 0..10 {
            assert!(admit(&limiter, "KEY1", 42, 1, 0));
        }
    }

    #[test]
    fn test_state() {
        let limiter = SlidingWindow::new();
        let (_, state) = limiter.check_and_record("KEY1", 0, 2, SECOND);
        assert_eq!(state.limit, 2);
        assert_eq!(state.remaining, 1);
        assert_eq!(state.reset, Duration::ZERO);
        let (_, state) = limiter.check_and_record("KEY1", 400, 2, SECOND);
        assert_eq!(state.remaining, 0);
        assert_eq!(state.reset, Duration::from_millis(600));
        let (decision, state) = limiter.check_and_record("KEY1", 500, 2, SECOND);
        assert!(decision.is_rejected());
        assert_eq!(state.remaining, 0);
        assert_eq!(state.reset, Duration::from_millis(500));
    }

    #[test]
    fn test_rollback_frees_a_slot() {
        let limiter = SlidingWindow::new();
        assert!(admit(&limiter, "KEY1", 10, 1, SECOND));
        assert!(limiter.rollback("KEY1", 10));
        assert!(!limiter.rollback("KEY1", 10));
        assert!(!limiter.rollback("MISSING", 10));
        assert!(admit(&limiter, "KEY1", 20, 1, SECOND));
    }

    #[test]
    fn test_sweep_only_evicts_idle_keys() {
        let limiter = SlidingWindow::new();
        admit(&limiter, "KEY1", 0, 5, SECOND);
        admit(&limiter, "KEY2", 0, 5, 10 * SECOND);
        admit(&limiter, "KEY2", 5 * SECOND, 5, 10 * SECOND);
        // KEY1's window has long passed, KEY2's newest entry is still within the widest window
        assert_eq!(limiter.sweep(12 * SECOND), 1);
        assert!(!limiter.store().contains_key("KEY1"));
        assert!(limiter.store().contains_key("KEY2"));
        assert_eq!(limiter.sweep(20 * SECOND), 1);
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_concurrent_checks_never_over_admit() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let limiter = Arc::new(SlidingWindow::new());
        let admitted = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if admit(&limiter, "KEY1", 0, 50, SECOND) {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::Relaxed), 50);
    }
}
