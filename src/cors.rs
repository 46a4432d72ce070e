use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use actix_web::http::Method;
use actix_web::HttpResponse;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;

pub const DEFAULT_ALLOW_ORIGIN: &str = "*";
pub const DEFAULT_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";
pub const DEFAULT_ALLOW_HEADERS: &str =
    "Origin, X-Requested-With, Content-Type, Accept, Authorization";

/// Permissive cross-origin middleware.
///
/// Preflight (`OPTIONS`) requests are answered immediately with an empty `200 OK`; no later
/// stage sees them. Every other response gets the `Access-Control-Allow-*` headers.
#[derive(Debug, Clone)]
pub struct Cors {
    headers: Rc<CorsHeaders>,
}

#[derive(Debug)]
struct CorsHeaders {
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
}

impl CorsHeaders {
    fn apply(&self, map: &mut HeaderMap) {
        map.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        map.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        map.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
    }
}

impl Default for Cors {
    fn default() -> Self {
        Self::permissive()
    }
}

impl Cors {
    pub fn permissive() -> Self {
        Self {
            headers: Rc::new(CorsHeaders {
                allow_origin: HeaderValue::from_static(DEFAULT_ALLOW_ORIGIN),
                allow_methods: HeaderValue::from_static(DEFAULT_ALLOW_METHODS),
                allow_headers: HeaderValue::from_static(DEFAULT_ALLOW_HEADERS),
            }),
        }
    }

    /// Restrict `Access-Control-Allow-Origin` to a single origin.
    pub fn allow_origin(self, origin: HeaderValue) -> Self {
        self.map(|headers| headers.allow_origin = origin)
    }

    pub fn allow_methods(self, methods: HeaderValue) -> Self {
        self.map(|headers| headers.allow_methods = methods)
    }

    pub fn allow_headers(self, allowed: HeaderValue) -> Self {
        self.map(|headers| headers.allow_headers = allowed)
    }

    fn map(self, f: impl FnOnce(&mut CorsHeaders)) -> Self {
        let mut headers = Rc::try_unwrap(self.headers).unwrap_or_else(|shared| CorsHeaders {
            allow_origin: shared.allow_origin.clone(),
            allow_methods: shared.allow_methods.clone(),
            allow_headers: shared.allow_headers.clone(),
        });
        f(&mut headers);
        Self {
            headers: Rc::new(headers),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Cors
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = CorsMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(CorsMiddleware {
            service: Rc::new(service),
            headers: self.headers.clone(),
        })
    }
}

pub struct CorsMiddleware<S> {
    service: Rc<S>,
    headers: Rc<CorsHeaders>,
}

impl<S, B> Service<ServiceRequest> for CorsMiddleware<S>
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
        let headers = self.headers.clone();

        Box::pin(async move {
            if *req.method() == Method::OPTIONS {
                let mut response = HttpResponse::Ok().finish();
                headers.apply(response.headers_mut());
                return Ok(req.into_response(response).map_into_right_body());
            }
            let mut response = service.call(req).await?;
            headers.apply(response.headers_mut());
            Ok(response.map_into_left_body())
        })
    }
}
