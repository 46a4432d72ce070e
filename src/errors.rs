//! Request faults and the stage that turns them into responses.
//!
//! Every stage that rejects a request does so with a [PipelineError], which knows its own wire
//! format. Anything else that fails inside the pipeline (a handler returning an error, an
//! extractor failing) is caught by [ErrorHandler] and rendered as a generic fault body.

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::StatusCode;
use actix_web::error::InternalError;
use actix_web::{HttpResponse, ResponseError};
use futures::future::{ok, LocalBoxFuture, Ready};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Field name to message, as produced by request validation.
pub type FieldErrors = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The client's sliding window is full.
    #[error("Too many requests")]
    AdmissionRejected,
    /// Missing or unacceptable credentials.
    #[error("{0}")]
    Unauthenticated(String),
    /// The request body broke one or more field rules.
    #[error("Validation failed for {} field(s)", .0.len())]
    ValidationFailed(FieldErrors),
    /// The request body could not be read as JSON at all.
    #[error("Validation error")]
    MalformedBody,
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl PipelineError {
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated(message.into())
    }
}

impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            PipelineError::ValidationFailed(_) | PipelineError::MalformedBody => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Fault(fault) => fault.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        match self {
            PipelineError::ValidationFailed(errors) => {
                HttpResponse::build(status).json(json!({ "errors": errors }))
            }
            PipelineError::Fault(fault) => fault.error_response(),
            _ => HttpResponse::build(status).json(json!({ "error": self.to_string() })),
        }
    }
}

/// A failure raised by a request handler, optionally declaring the status to respond with.
#[derive(Debug, Clone)]
pub struct Fault {
    status: Option<StatusCode>,
    message: String,
    details: Option<Value>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Extra diagnostic data, only sent to clients when verbose diagnostics are enabled.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for Fault {}

impl ResponseError for Fault {
    fn status_code(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        FaultReport {
            status: self.status_code(),
            message: self.message.clone(),
            stack: None,
            details: None,
        }
        .into_response()
    }
}

/// The generic fault body: `{"error": {"message", "status", ["stack"], ["details"]}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultReport {
    pub status: StatusCode,
    pub message: String,
    pub stack: Option<String>,
    pub details: Option<Value>,
}

impl FaultReport {
    pub fn from_error(error: &actix_web::Error, verbose: bool) -> Self {
        let response_error = error.as_response_error();
        let message = match error.to_string() {
            message if message.is_empty() => "Internal server error".to_owned(),
            message => message,
        };
        let mut report = FaultReport {
            status: response_error.status_code(),
            message,
            stack: None,
            details: None,
        };
        if verbose {
            report.stack = Some(trace(error));
            report.details = error
                .as_error::<Fault>()
                .or_else(|| match error.as_error::<PipelineError>() {
                    Some(PipelineError::Fault(fault)) => Some(fault),
                    _ => None,
                })
                .and_then(|fault| fault.details.clone());
        }
        report
    }

    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("message".to_owned(), Value::from(self.message.clone()));
        body.insert("status".to_owned(), Value::from(self.status.as_u16()));
        if let Some(stack) = &self.stack {
            body.insert("stack".to_owned(), Value::from(stack.clone()));
        }
        if let Some(details) = &self.details {
            body.insert("details".to_owned(), details.clone());
        }
        json!({ "error": body })
    }

    pub fn into_response(self) -> HttpResponse {
        HttpResponse::build(self.status).json(self.to_json())
    }
}

// The debug representation stands in for a stack trace.
fn trace(error: &actix_web::Error) -> String {
    format!("{:?}", error)
}

/// Renders a response for an error caught by the fault stage.
///
/// The pipeline's own rejections keep their specific bodies, everything else becomes a
/// [FaultReport].
fn render(error: &actix_web::Error, verbose: bool) -> HttpResponse {
    match error.as_error::<PipelineError>() {
        Some(PipelineError::Fault(_)) | None => {
            FaultReport::from_error(error, verbose).into_response()
        }
        Some(rejection) => rejection.error_response(),
    }
}

/// The fault handling stage.
///
/// Catches errors returned by any inner stage or handler and replaces the response with a JSON
/// fault body. Diagnostic detail (`stack`, `details`) is only included when `verbose` is set.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
    verbose: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include diagnostic detail in fault responses. Never enable this in production.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for ErrorHandler
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = ErrorHandlerMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ErrorHandlerMiddleware {
            service: Rc::new(service),
            verbose: self.verbose,
        })
    }
}

pub struct ErrorHandlerMiddleware<S> {
    service: Rc<S>,
    verbose: bool,
}

impl<S, B> Service<ServiceRequest> for ErrorHandlerMiddleware<S>
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
        let verbose = self.verbose;
        let method = req.method().to_string();
        let path = req.path().to_owned();

        Box::pin(async move {
            match service.call(req).await {
                Ok(res) => {
                    let response = match res.response().error() {
                        None => return Ok(res.map_into_left_body()),
                        Some(e) => {
                            log::error!("Request error: {method} {path} - {e}");
                            render(e, verbose)
                        }
                    };
                    Ok(res.into_response(response).map_into_right_body())
                }
                // No request left to build a response from, so the rendered fault travels
                // outwards inside the error
                Err(e) => {
                    log::error!("Request error: {method} {path} - {e}");
                    let response = render(&e, verbose);
                    Err(InternalError::from_response(e, response).into())
                }
            }
        })
    }
}
