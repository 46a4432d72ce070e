use actix_web::rt::time::Instant;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Milliseconds since a clock's fixed origin.
pub type Timestamp = u64;

/// A monotonic source of [Timestamp]s.
///
/// Successive calls on the same clock must never go backwards.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// The default [Clock], measuring elapsed time since it was created.
///
/// Uses the actix (tokio) [Instant], so that pausing and advancing tokio time in tests is
/// observed by the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Instant::now()
            .saturating_duration_since(self.origin)
            .as_millis()
            .try_into()
            .unwrap_or(Timestamp::MAX)
    }
}

/// A [Clock] that only moves when told to.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to `timestamp`, ignored if it would move the clock backwards.
    pub fn set(&self, timestamp: Timestamp) {
        self.0.fetch_max(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[actix_web::test]
    async fn test_monotonic_clock_follows_tokio_time() {
        tokio::time::pause();
        let clock = MonotonicClock::new();
        assert_eq!(clock.now(), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now(), 1500);
    }

    #[test]
    fn test_manual_clock_never_goes_backwards() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 150);
        clock.set(1000);
        assert_eq!(clock.clone().now(), 1000);
    }
}
