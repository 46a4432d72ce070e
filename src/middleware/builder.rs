use crate::backend::Backend;
use crate::errors::PipelineError;
use crate::middleware::{AdmittedTransformation, Policy, RateLimiter, RollbackCondition};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    policy: Policy<BO>,
}

fn too_many_requests() -> HttpResponse {
    PipelineError::AdmissionRejected.error_response()
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            policy: Policy {
                fail_open: false,
                admitted_transformation: None,
                rejected_response: Box::new(|_| too_many_requests()),
                rollback_condition: None,
            },
        }
    }

    /// Choose whether to admit a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.policy.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_admitted_transformation] and
    /// [RateLimiterBuilder::request_rejected_response] functions, such that the following headers
    /// are set in both the admitted and rejected responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until a slot frees up)
    /// - `retry-after` (rejected only, seconds until a slot frees up)
    ///
    /// This function requires the Backend Output to implement [HeaderCompatibleOutput]
    pub fn add_headers(mut self) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        self.policy.admitted_transformation = Some(Box::new(|map, output, rolled_back| {
            if let Some(status) = output {
                map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
                // A rolled back request gave its slot back
                let remaining = if rolled_back {
                    status.remaining().saturating_add(1).min(status.limit())
                } else {
                    status.remaining()
                };
                map.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
                map.insert(
                    X_RATELIMIT_RESET.clone(),
                    HeaderValue::from(status.seconds_until_reset()),
                );
            }
        }));
        self.policy.rejected_response = Box::new(|status| {
            let mut response = too_many_requests();
            let map = response.headers_mut();
            map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
            map.insert(
                X_RATELIMIT_REMAINING.clone(),
                HeaderValue::from(status.remaining()),
            );
            let seconds = status.seconds_until_reset();
            map.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(seconds));
            map.insert(RETRY_AFTER, HeaderValue::from(seconds));
            response
        });
        self
    }

    /// In the event that the request is admitted:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    /// The final argument tells whether the request was rolled back.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [Backend::Output] will be [None] if the backend failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_admitted_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>, bool) + 'static,
    {
        self.policy.admitted_transformation =
            mutation.map(|m| Box::new(m) as Box<AdmittedTransformation<BO>>);
        self
    }

    /// In the event that the request is rejected, configure the [HttpResponse] returned.
    ///
    /// Defaults to status 429 with the body `{"error": "Too many requests"}`.
    pub fn request_rejected_response<R>(mut self, rejected_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.policy.rejected_response = Box::new(rejected_response);
        self
    }

    /// After processing a request, attempt to rollback the admission based on the status code
    /// of the returned response.
    ///
    /// By default an admission is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.policy.rollback_condition = condition.map(|m| Box::new(m) as Box<RollbackCondition>);
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.policy.rollback_condition = Some(Box::new(|status| status.is_server_error()));
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            policy: Rc::new(self.policy),
        }
    }
}

/// A trait that a [Backend::Output] should implement in order to use the
/// [RateLimiterBuilder::add_headers] function.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until another request would be admitted.\
    /// If a request would already be admitted this should return 0.
    fn seconds_until_reset(&self) -> u64;
}
