//! The standard middleware chain, assembled from a [PipelineConfig].
//!
//! Stages run in this order for every request (outermost first):
//!
//! 1. [RequestLogger] assigns a request id and runs the completion hooks,
//! 2. [Cors] answers preflight requests and decorates every other response,
//! 3. [ErrorHandler] turns faults raised by anything below it into JSON fault responses,
//! 4. [Authentication] rejects requests without credentials,
//! 5. [RateLimiter] rejects clients whose sliding window is full,
//!
//! and finally the application's handler. Request body validation depends on the route, so
//! [ValidateJson](crate::validation::ValidateJson) is attached to individual routes or scopes.

use crate::auth::{Authentication, CredentialVerifier};
use crate::backend::memory::InMemoryBackend;
use crate::backend::{SimpleInputFunctionBuilder, SimpleInputFuture, SimpleOutput};
use crate::config::{ClientKeySource, PipelineConfig};
use crate::cors::Cors;
use crate::errors::ErrorHandler;
use crate::logging::{AccessLogHook, CompletionHook, PerformanceHook, RequestLogger};
use crate::RateLimiter;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::App;
use std::time::Duration;

/// The backend shared by every worker's [Pipeline].
///
/// Must be called from within the actix runtime when garbage collection is enabled.
pub fn shared_backend(config: &PipelineConfig) -> InMemoryBackend {
    InMemoryBackend::builder()
        .with_gc_interval(config.rate_limit.gc_interval())
        .build()
}

/// Builds the pipeline stages for one worker.
///
/// ```no_run
/// # use actix_guarded_pipeline::{config::PipelineConfig, pipeline::{shared_backend, Pipeline}};
/// # use actix_web::{web, App, HttpResponse, HttpServer};
/// # async fn run() -> std::io::Result<()> {
/// let config = PipelineConfig::default();
/// let backend = shared_backend(&config);
/// HttpServer::new(move || {
///     let app = App::new().route("/", web::get().to(|| async { HttpResponse::Ok().finish() }));
///     Pipeline::new(config.clone(), backend.clone()).apply(app)
/// })
/// .bind(("127.0.0.1", 8080))?
/// .run()
/// .await
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    backend: InMemoryBackend,
    authentication: Authentication,
    logger: RequestLogger,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backend: InMemoryBackend) -> Self {
        let mut logger = RequestLogger::new().hook(PerformanceHook::new(Duration::from_millis(
            config.logging.slow_request_ms,
        )));
        if config.logging.access_log {
            logger = logger.hook(AccessLogHook);
        }
        Self {
            config,
            backend,
            authentication: Authentication::default(),
            logger,
        }
    }

    /// Replace the default credential verifier.
    pub fn verifier(mut self, verifier: impl CredentialVerifier + 'static) -> Self {
        self.authentication = Authentication::new(verifier);
        self
    }

    /// Register an additional completion hook.
    pub fn hook(mut self, hook: impl CompletionHook + 'static) -> Self {
        self.logger = self.logger.hook(hook);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn error_handler(&self) -> ErrorHandler {
        ErrorHandler::new().verbose(self.config.diagnostics.verbose)
    }

    pub fn rate_limiter(
        &self,
    ) -> RateLimiter<
        InMemoryBackend,
        SimpleOutput,
        impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static,
    > {
        let settings = &self.config.rate_limit;
        let input = SimpleInputFunctionBuilder::new(settings.window(), settings.capacity);
        let input = match settings.key {
            ClientKeySource::PeerIp => input.peer_ip_key(),
            ClientKeySource::RealIp => input.real_ip_key(),
        };
        let mut builder = RateLimiter::builder(self.backend.clone(), input.build());
        if settings.headers {
            builder = builder.add_headers();
        }
        if settings.rollback_server_errors {
            builder = builder.rollback_server_errors();
        }
        builder.build()
    }

    /// Wraps `app` in every stage, in the order described in the [module docs](self).
    pub fn apply<T, B>(
        self,
        app: App<T>,
    ) -> App<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse<impl MessageBody>,
            Error = actix_web::Error,
            InitError = (),
        >,
    >
    where
        T: ServiceFactory<
                ServiceRequest,
                Config = (),
                Response = ServiceResponse<B>,
                Error = actix_web::Error,
                InitError = (),
            > + 'static,
        B: MessageBody + 'static,
    {
        let rate_limiter = self.rate_limiter();
        let error_handler = self.error_handler();
        app.wrap(rate_limiter)
            .wrap(self.authentication)
            .wrap(error_handler)
            .wrap(Cors::default())
            .wrap(self.logger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::clock::ManualClock;
    use crate::context::{ClientKey, Principal};
    use crate::errors::Fault;
    use crate::validation::{FieldKind, FieldRule, Schema, ValidateJson};
    use actix_web::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION};
    use actix_web::http::{Method, StatusCode};
    use actix_web::test::{self, read_body_json, TestRequest};
    use actix_web::{web, HttpResponse};
    use serde_json::{json, Value};
    use std::cell::Cell;
    use std::net::SocketAddr;
    use std::rc::Rc;

    fn config(capacity: u64, verbose: bool) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.rate_limit.capacity = capacity;
        config.rate_limit.window_ms = 1000;
        config.rate_limit.gc_interval_secs = None;
        config.diagnostics.verbose = verbose;
        config
    }

    fn backend(clock: &ManualClock) -> InMemoryBackend {
        InMemoryBackend::builder()
            .with_gc_interval(None)
            .with_clock(clock.clone())
            .build()
    }

    fn authorized(method: Method, uri: &str) -> TestRequest {
        TestRequest::default()
            .method(method)
            .uri(uri)
            .peer_addr("192.168.1.20:5000".parse::<SocketAddr>().unwrap())
            .insert_header((AUTHORIZATION, "Bearer secret"))
    }

    #[actix_web::test]
    async fn test_full_chain() {
        let clock = ManualClock::new(0);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let app = test::init_service(Pipeline::new(config(2, false), backend(&clock)).apply(
            App::new().route(
                "/items",
                web::get().to(move |principal: Principal, key: ClientKey| {
                    counter.set(counter.get() + 1);
                    async move {
                        HttpResponse::Ok().json(json!({ "user": principal.id, "client": key.as_str() }))
                    }
                }),
            ),
        ))
        .await;

        // Preflight never reaches authentication or the handler
        let response = test::call_service(
            &app,
            TestRequest::default()
                .method(Method::OPTIONS)
                .uri("/items")
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.get(), 0);

        // Missing credentials
        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/items")
                .peer_addr("192.168.1.20:5000".parse::<SocketAddr>().unwrap())
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        let body: Value = read_body_json(response).await;
        assert_eq!(body, json!({ "error": "No authorization header" }));
        assert_eq!(calls.get(), 0);

        // Two admitted, the third rejected
        for _ in 0..2 {
            let response =
                test::call_service(&app, authorized(Method::GET, "/items").to_request()).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body: Value = read_body_json(response).await;
            assert_eq!(body, json!({ "user": "secret", "client": "192.168.1.20" }));
        }
        let response =
            test::call_service(&app, authorized(Method::GET, "/items").to_request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = read_body_json(response).await;
        assert_eq!(body, json!({ "error": "Too many requests" }));
        assert_eq!(calls.get(), 2);

        // Unauthenticated requests were never counted, and the window slides on
        clock.set(1000);
        let response =
            test::call_service(&app, authorized(Method::GET, "/items").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.get(), 3);
    }

    #[actix_web::test]
    async fn test_faults_are_rendered() {
        let clock = ManualClock::new(0);
        let build = |verbose| {
            Pipeline::new(config(10, verbose), backend(&clock)).apply(
                App::new().route(
                    "/fail",
                    web::get().to(|| async {
                        Err::<HttpResponse, _>(
                            Fault::new("Database unavailable")
                                .with_status(StatusCode::SERVICE_UNAVAILABLE),
                        )
                    }),
                ),
            )
        };

        let app = test::init_service(build(false)).await;
        let response =
            test::call_service(&app, authorized(Method::GET, "/fail").to_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = read_body_json(response).await;
        assert_eq!(
            body,
            json!({ "error": { "message": "Database unavailable", "status": 503 } })
        );

        let app = test::init_service(build(true)).await;
        let response =
            test::call_service(&app, authorized(Method::GET, "/fail").to_request()).await;
        let body: Value = read_body_json(response).await;
        assert!(body["error"]["stack"].is_string());
    }

    #[actix_web::test]
    async fn test_unidentifiable_client_is_a_fault() {
        let clock = ManualClock::new(0);
        let app = test::init_service(Pipeline::new(config(10, false), backend(&clock)).apply(
            App::new().route("/items", web::get().to(|| async { HttpResponse::Ok().finish() })),
        ))
        .await;
        // No peer address to derive a client key from
        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/items")
                .insert_header((AUTHORIZATION, "Bearer secret"))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        let body: Value = read_body_json(response).await;
        assert_eq!(
            body,
            json!({ "error": { "message": "Request has no remote address", "status": 500 } })
        );
    }

    #[actix_web::test]
    async fn test_validated_route() {
        let clock = ManualClock::new(0);
        let schema = Schema::new().field("email", FieldRule::required().kind(FieldKind::String));
        let app = test::init_service(Pipeline::new(config(10, false), backend(&clock)).apply(
            App::new().service(
                web::resource("/users")
                    .wrap(ValidateJson::new(schema))
                    .route(web::post().to(|| async { HttpResponse::Created().finish() })),
            ),
        ))
        .await;

        let response =
            test::call_service(&app, authorized(Method::POST, "/users").to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_body_json(response).await;
        assert_eq!(body["errors"]["email"], "email is required");

        let response = test::call_service(
            &app,
            authorized(Method::POST, "/users")
                .set_json(json!({ "email": "test@example.com" }))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
