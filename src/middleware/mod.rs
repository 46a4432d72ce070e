pub mod builder;

use crate::backend::{Backend, ClientKeyed};
use crate::context::ClientKey;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::{HttpMessage, HttpResponse};
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::{future::Future, rc::Rc};

type AdmittedTransformation<BO> = dyn Fn(&mut HeaderMap, Option<&BO>, bool);
type RejectedResponse<BO> = dyn Fn(&BO) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// What the limiter does with each outcome, shared by every service it creates.
struct Policy<BO> {
    fail_open: bool,
    admitted_transformation: Option<Box<AdmittedTransformation<BO>>>,
    rejected_response: Box<RejectedResponse<BO>>,
    rollback_condition: Option<Box<RollbackCondition>>,
}

impl<BO> Policy<BO> {
    fn should_rollback(&self, status: StatusCode) -> bool {
        self.rollback_condition
            .as_ref()
            .map(|condition| condition(status))
            .unwrap_or(false)
    }
}

/// Sliding window rate limit middleware.
///
/// For every request the input function derives the client key and policy, the [Backend] decides
/// whether to admit it, and a rejected request is answered immediately (by default with
/// `429 {"error": "Too many requests"}`) without reaching any later stage.
///
/// The [ClientKey] and the [Decision](crate::backend::Decision) are stored in the request
/// extensions. Failures to derive the input, or of the backend when not failing open, are
/// returned as errors on the response so that the fault stage renders them.
pub struct RateLimiter<BA, BO, F> {
    backend: BA,
    input_fn: Rc<F>,
    policy: Rc<Policy<BO>>,
}

impl<BA: Clone, BO, F> Clone for RateLimiter<BA, BO, F> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            input_fn: self.input_fn.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<BA, BI, BO, F, O> RateLimiter<BA, BO, F>
where
    BA: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `input_fn`: A future that produces input to the backend (the client key and policy)
    ///   based on the incoming request.
    pub fn builder(backend: BA, input_fn: F) -> RateLimiterBuilder<BA, BO, F> {
        RateLimiterBuilder::new(backend, input_fn)
    }
}

impl<S, B, BA, BI, BO, BE, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: ClientKeyed + 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, BO, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(service),
            backend: self.backend.clone(),
            input_fn: self.input_fn.clone(),
            policy: self.policy.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, BO, F> {
    service: Rc<S>,
    backend: BA,
    input_fn: Rc<F>,
    policy: Rc<Policy<BO>>,
}

impl<S, B, BA, BI, BO, BE, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: ClientKeyed + 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let backend = self.backend.clone();
        let input_fn = self.input_fn.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Unable to identify the client of {}: {e}", req.path());
                    return Ok(req.error_response(e).map_into_right_body());
                }
            };
            let key = ClientKey::new(input.client_key());
            req.extensions_mut().insert(key.clone());

            let (output, token) = match backend.request(input).await {
                Ok((decision, output, token)) => {
                    req.extensions_mut().insert(decision);
                    if decision.is_rejected() {
                        log::debug!("Rate limit exceeded for client {key} on {}", req.path());
                        let response = (policy.rejected_response)(&output);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    (Some(output), Some(token))
                }
                Err(e) if policy.fail_open => {
                    log::warn!("Rate limiter failed for client {key}: {e}, admitting the request anyway");
                    (None, None)
                }
                Err(e) => {
                    log::error!("Rate limiter failed for client {key}: {e}");
                    return Ok(req.error_response(e).map_into_right_body());
                }
            };

            let mut response = service.call(req).await?;

            let status = response.status();
            let rolled_back = match token {
                Some(token) if policy.should_rollback(status) => {
                    match backend.rollback(token).await {
                        Ok(()) => true,
                        Err(e) => {
                            log::error!("Unable to roll back client {key} after a {status} response: {e}");
                            false
                        }
                    }
                }
                _ => false,
            };

            if let Some(transformation) = &policy.admitted_transformation {
                transformation(response.headers_mut(), output.as_ref(), rolled_back);
            }

            Ok(response.map_into_left_body())
        })
    }
}
