//! Request logging through post-completion hooks.
//!
//! [RequestLogger] stamps every request with a [RequestId] and, once the inner stages have
//! produced the final response, hands a [Completion] record to each registered
//! [CompletionHook]. Hooks are plain values passed in at construction, so what gets logged and
//! where is decided by the application.

use crate::context::{ClientKey, RequestId};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use actix_web::rt::time::Instant;
use actix_web::HttpMessage;
use futures::future::{ok, LocalBoxFuture, Ready};
use once_cell::sync::Lazy;
use std::rc::Rc;
use std::time::Duration;

pub static X_REQUEST_ID: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-request-id"));

pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(1000);

/// Summary of a finished request.
#[derive(Debug, Clone)]
pub struct Completion<'a> {
    pub request_id: RequestId,
    pub method: &'a Method,
    pub path: &'a str,
    pub status: StatusCode,
    pub duration: Duration,
    /// Set when the request went through the rate limiter.
    pub client_key: Option<&'a ClientKey>,
}

impl Completion<'_> {
    /// `GET /api/items - 200 - 12ms`
    pub fn summary(&self) -> String {
        format!(
            "{} {} - {} - {}ms",
            self.method,
            self.path,
            self.status.as_u16(),
            self.duration.as_millis()
        )
    }
}

/// Invoked by [RequestLogger] after the response for a request has been produced.
pub trait CompletionHook {
    fn on_complete(&self, completion: &Completion<'_>);
}

/// Logs every request at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogHook;

impl CompletionHook for AccessLogHook {
    fn on_complete(&self, completion: &Completion<'_>) {
        log::info!("{}", completion.summary());
    }
}

/// Logs slow or failed requests at `warn` level, and everything else at `info`.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceHook {
    slow_threshold: Duration,
}

impl Default for PerformanceHook {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_THRESHOLD)
    }
}

impl PerformanceHook {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    pub fn is_slow(&self, completion: &Completion<'_>) -> bool {
        completion.duration > self.slow_threshold
    }
}

impl CompletionHook for PerformanceHook {
    fn on_complete(&self, completion: &Completion<'_>) {
        let slow = self.is_slow(completion);
        if slow || completion.status.as_u16() >= 400 {
            log::warn!(
                "{} (request {}, client {}, slow: {slow})",
                completion.summary(),
                completion.request_id,
                completion.client_key.map(ClientKey::as_str).unwrap_or("-")
            );
        } else {
            log::info!("{} (request {})", completion.summary(), completion.request_id);
        }
    }
}

/// Request logging middleware.
///
/// Without any hooks it only assigns request ids.
#[derive(Clone, Default)]
pub struct RequestLogger {
    hooks: Vec<Rc<dyn CompletionHook>>,
}

impl RequestLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(mut self, hook: impl CompletionHook + 'static) -> Self {
        self.hooks.push(Rc::new(hook));
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Transform = RequestLoggerMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RequestLoggerMiddleware {
            service: Rc::new(service),
            hooks: Rc::new(self.hooks.clone()),
        })
    }
}

pub struct RequestLoggerMiddleware<S> {
    service: Rc<S>,
    hooks: Rc<Vec<Rc<dyn CompletionHook>>>,
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let hooks = self.hooks.clone();
        let start = Instant::now();
        let request_id = RequestId::new();
        req.extensions_mut().insert(request_id);
        let method = req.method().clone();
        let path = req.path().to_owned();
        log::debug!("Incoming request {request_id}: {method} {path}");

        Box::pin(async move {
            let result = service.call(req).await;
            let (status, client_key) = match &result {
                Ok(response) => (
                    response.status(),
                    response.request().extensions().get::<ClientKey>().cloned(),
                ),
                Err(e) => (e.as_response_error().status_code(), None),
            };
            let completion = Completion {
                request_id,
                method: &method,
                path: &path,
                status,
                duration: start.elapsed(),
                client_key: client_key.as_ref(),
            };
            for hook in hooks.iter() {
                hook.on_complete(&completion);
            }
            let mut response = result?;
            if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
                response.headers_mut().insert(X_REQUEST_ID.clone(), value);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::{self, TestRequest};
    use actix_web::{web, App, HttpResponse};
    use std::cell::RefCell;

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<(String, u16, Duration, Option<String>)>>>);

    impl CompletionHook for Recorder {
        fn on_complete(&self, completion: &Completion<'_>) {
            self.0.borrow_mut().push((
                completion.summary(),
                completion.status.as_u16(),
                completion.duration,
                completion.client_key.map(ToString::to_string),
            ));
        }
    }

    #[actix_web::test]
    async fn test_hooks_run_after_completion() {
        tokio::time::pause();
        let recorder = Recorder::default();
        let app = test::init_service(
            App::new()
                .route(
                    "/slow",
                    web::get().to(|id: RequestId| async move {
                        actix_web::rt::time::sleep(Duration::from_millis(1500)).await;
                        HttpResponse::Ok().body(id.to_string())
                    }),
                )
                .wrap(
                    RequestLogger::new()
                        .hook(recorder.clone())
                        .hook(PerformanceHook::default()),
                ),
        )
        .await;
        let response = test::call_service(&app, TestRequest::get().uri("/slow").to_request()).await;
        let header = response
            .headers()
            .get(&*X_REQUEST_ID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        // The handler saw the same id that was sent back to the client
        assert_eq!(test::read_body(response).await, header.as_str());

        let records = recorder.0.borrow();
        assert_eq!(records.len(), 1);
        assert!(records[0].0.starts_with("GET /slow - 200 - "));
        assert!(records[0].2 >= Duration::from_millis(1500));
        assert!(PerformanceHook::default().is_slow(&Completion {
            request_id: RequestId::new(),
            method: &Method::GET,
            path: "/slow",
            status: StatusCode::OK,
            duration: records[0].2,
            client_key: None,
        }));
    }

    #[actix_web::test]
    async fn test_hook_sees_final_status() {
        let recorder = Recorder::default();
        let app = test::init_service(
            App::new()
                .route(
                    "/missing",
                    web::get().to(|| async { HttpResponse::NotFound().finish() }),
                )
                .wrap(RequestLogger::new().hook(recorder.clone())),
        )
        .await;
        test::call_service(&app, TestRequest::get().uri("/missing").to_request()).await;
        let records = recorder.0.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, 404);
    }

    #[actix_web::test]
    async fn test_hook_sees_client_key() {
        let recorder = Recorder::default();
        let app = test::init_service(
            App::new()
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .wrap_fn(|req, srv| {
                    req.extensions_mut().insert(ClientKey::new("10.0.0.1"));
                    srv.call(req)
                })
                .wrap(RequestLogger::new().hook(recorder.clone())),
        )
        .await;
        test::call_service(&app, TestRequest::get().uri("/").to_request()).await;
        let records = recorder.0.borrow();
        assert_eq!(records[0].3.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_summary() {
        let completion = Completion {
            request_id: RequestId::new(),
            method: &Method::POST,
            path: "/api/items",
            status: StatusCode::CREATED,
            duration: Duration::from_millis(12),
            client_key: None,
        };
        assert_eq!(completion.summary(), "POST /api/items - 201 - 12ms");
        assert!(!PerformanceHook::default().is_slow(&completion));
    }
}
