use crate::backend::clock::{Clock, MonotonicClock, Timestamp};
use crate::backend::sliding_window::SlidingWindow;
use crate::backend::{
    Backend, SimpleBackend, SimpleInput, SimpleOutput, DEFAULT_GC_INTERVAL_SECONDS,
};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use std::sync::Arc;
use std::time::Duration;

/// A sliding window rate limiter [Backend] that keeps every client's request log in memory.
#[derive(Clone)]
pub struct InMemoryBackend {
    limiter: Arc<SlidingWindow>,
    clock: Arc<dyn Clock>,
    gc: Option<Arc<GarbageCollector>>,
}

/// Owns the garbage collector task and stops it once the last backend clone lets go.
struct GarbageCollector(JoinHandle<()>);

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Identifies an admitted request so that it can be rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackToken {
    pub key: String,
    pub timestamp: Timestamp,
}

impl InMemoryBackend {
    pub fn builder() -> Builder {
        Builder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            clock: None,
        }
    }

    fn garbage_collector(
        limiter: Arc<SlidingWindow>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        // The first sweep happens one interval after the backend is built
        let mut ticks = actix_web::rt::time::interval_at(Instant::now() + interval, interval);
        actix_web::rt::spawn(async move {
            loop {
                ticks.tick().await;
                let evicted = limiter.sweep(clock.now());
                if evicted > 0 {
                    log::debug!("Rate limiter evicted {evicted} idle client keys");
                }
            }
        })
    }

    /// The underlying sliding window limiter.
    pub fn limiter(&self) -> &SlidingWindow {
        &self.limiter
    }
}

impl Backend<SimpleInput> for InMemoryBackend {
    type Output = SimpleOutput;
    type RollbackToken = RollbackToken;
    type Error = actix_web::Error;

    async fn request(
        &self,
        input: SimpleInput,
    ) -> Result<(crate::backend::Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let now = self.clock.now();
        let (decision, state) =
            self.limiter
                .check_and_record(&input.key, now, input.capacity, input.window_ms());
        let output = SimpleOutput {
            limit: state.limit,
            remaining: state.remaining,
            reset: Instant::now() + state.reset,
        };
        let token = RollbackToken {
            key: input.key,
            timestamp: now,
        };
        Ok((decision, output, token))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        if !self.limiter.rollback(&token.key, token.timestamp) {
            log::debug!(
                "Nothing to roll back for key {} at {}, it has already left the window",
                token.key,
                token.timestamp
            );
        }
        Ok(())
    }
}

impl SimpleBackend for InMemoryBackend {
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.limiter.remove_key(key);
        Ok(())
    }
}

pub struct Builder {
    gc_interval: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl Builder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the store, evicting clients whose request logs
    /// have entirely left the window.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Override the time source; defaults to a [MonotonicClock].
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn build(self) -> InMemoryBackend {
        let limiter = Arc::new(SlidingWindow::new());
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let gc = self.gc_interval.map(|gc_interval| {
            Arc::new(GarbageCollector(InMemoryBackend::garbage_collector(
                limiter.clone(),
                clock.clone(),
                gc_interval,
            )))
        });
        InMemoryBackend { limiter, clock, gc }
    }
}
