use crate::context::Principal;
use crate::errors::PipelineError;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::AUTHORIZATION;
use actix_web::{HttpMessage, ResponseError};
use async_trait::async_trait;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;

/// Turns a presented credential into a [Principal].
///
/// Verification strength is entirely up to the implementation; returning
/// [PipelineError::Unauthenticated] rejects the request with that message.
#[async_trait(?Send)]
pub trait CredentialVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, PipelineError>;
}

/// Accepts any non-empty token without checking it, identifying the caller by the token itself.
///
/// Only suitable where an upstream component has already authenticated the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughVerifier;

#[async_trait(?Send)]
impl CredentialVerifier for PassthroughVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, PipelineError> {
        Ok(Principal {
            id: token.to_owned(),
            token: token.to_owned(),
        })
    }
}

/// Authentication middleware.
///
/// Requests without an `Authorization` header are rejected with `401` before reaching any later
/// stage. A `Bearer ` prefix is optional. On success the [Principal] is stored in the request
/// extensions, where handlers can extract it.
#[derive(Clone)]
pub struct Authentication {
    verifier: Rc<dyn CredentialVerifier>,
}

impl Default for Authentication {
    fn default() -> Self {
        Self::new(PassthroughVerifier)
    }
}

impl Authentication {
    pub fn new(verifier: impl CredentialVerifier + 'static) -> Self {
        Self {
            verifier: Rc::new(verifier),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = AuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthenticationMiddleware {
            service: Rc::new(service),
            verifier: self.verifier.clone(),
        })
    }
}

pub struct AuthenticationMiddleware<S> {
    service: Rc<S>,
    verifier: Rc<dyn CredentialVerifier>,
}

/// Extracts the token from an `Authorization` header value.
fn bearer_token(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header).trim()
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let verifier = self.verifier.clone();

        Box::pin(async move {
            // A blank header counts as no header at all
            let token = match req.headers().get(AUTHORIZATION) {
                Some(value) if !value.as_bytes().iter().all(u8::is_ascii_whitespace) => {
                    Some(value.to_str().map(|v| bearer_token(v).to_owned()))
                }
                _ => None,
            };
            let rejection = match token {
                None => Some(PipelineError::unauthenticated("No authorization header")),
                Some(Err(_)) => Some(PipelineError::unauthenticated("Invalid token")),
                Some(Ok(token)) if token.is_empty() => {
                    Some(PipelineError::unauthenticated("Invalid token"))
                }
                Some(Ok(token)) => match verifier.verify(&token).await {
                    Ok(principal) => {
                        req.extensions_mut().insert(principal);
                        None
                    }
                    Err(e @ PipelineError::Unauthenticated(_)) => Some(e),
                    Err(e) => {
                        log::warn!("Credential verification failed: {e}");
                        Some(PipelineError::unauthenticated("Authentication failed"))
                    }
                },
            };

            if let Some(rejection) = rejection {
                log::debug!("Rejected unauthenticated request to {}: {rejection}", req.path());
                return Ok(req
                    .into_response(rejection.error_response())
                    .map_into_right_body());
            }

            let response = service.call(req).await?;
            Ok(response.map_into_left_body())
        })
    }
}
