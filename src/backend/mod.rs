pub mod clock;
mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod sliding_window;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod store;

pub use input_builder::{InputError, SimpleInputFunctionBuilder, SimpleInputFuture};
use std::future::Future;

use crate::HeaderCompatibleOutput;
use actix_web::rt::time::Instant;
use std::time::Duration;

/// Default interval between sweeps for idle clients.
pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// Outcome of an admission check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Admit,
    Reject,
}

impl Decision {
    pub fn from_admitted(admitted: bool) -> Self {
        if admitted {
            Self::Admit
        } else {
            Self::Reject
        }
    }

    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admit)
    }

    pub fn is_rejected(self) -> bool {
        matches!(self, Self::Reject)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc).
pub trait Backend<I: 'static = SimpleInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Process an incoming request.
    ///
    /// The input includes the client key and the policy (capacity and window) to be applied.
    ///
    /// Returns whether to admit or reject the request, arbitrary output that can be used
    /// to transform the admitted and rejected responses, and a token to allow the admission
    /// to be rolled back in certain conditions.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Remove an admitted request from the client's window after the fact.
    ///
    /// E.g. We may want to exclude 5xx errors from counting against a client's rate limit,
    /// we can only exclude them after having already admitted the request in the first place.
    ///
    /// Note that if this function fails there is not much the [RateLimiter](crate::RateLimiter)
    /// can do about it, given that the request has already been admitted.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// A default [Backend] Input structure.
#[derive(Debug, Clone)]
pub struct SimpleInput {
    /// Length of the trailing window.
    pub window: Duration,
    /// Maximum requests admitted within any window.
    pub capacity: u64,
    /// The client key to be used for this request.
    pub key: String,
}

impl SimpleInput {
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis().try_into().unwrap_or(u64::MAX)
    }
}

/// A [Backend] input that names the client it is accounted against.
///
/// The [RateLimiter](crate::RateLimiter) stores this key in the request extensions as a
/// [ClientKey](crate::context::ClientKey).
pub trait ClientKeyed {
    fn client_key(&self) -> &str;
}

impl ClientKeyed for SimpleInput {
    fn client_key(&self) -> &str {
        &self.key
    }
}

/// A default [Backend::Output] structure.
#[derive(Debug, Clone)]
pub struct SimpleOutput {
    /// Maximum requests admitted within any window.
    pub limit: u64,
    /// Number of requests that would currently be admitted.
    pub remaining: u64,
    /// Time at which a request would be admitted; now if a slot is free.
    pub reset: Instant,
}

/// Additional functions for a [Backend] that uses [SimpleInput] and [SimpleOutput].
pub trait SimpleBackend: Backend<SimpleInput, Output = SimpleOutput> {
    /// Removes the request log for a given client key.
    ///
    /// Intended to be used to reset a key before changing the window.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

impl HeaderCompatibleOutput for SimpleOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the next slot frees up (rounded upwards, so that a slot is guaranteed to be
    /// free after waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}
