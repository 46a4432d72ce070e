#![cfg_attr(docsrs, feature(doc_cfg))]
//! Request middleware for actix-web: CORS, authentication, JSON body validation, fault rendering,
//! request logging and per-client sliding window rate limiting.
//!
//! The stages can be used individually, or assembled in their standard order with
//! [Pipeline](pipeline::Pipeline).

pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod cors;
pub mod errors;
pub mod logging;
mod middleware;
#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod pipeline;
pub mod validation;

pub use middleware::builder::{
    HeaderCompatibleOutput, RateLimiterBuilder, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use middleware::RateLimiter;
