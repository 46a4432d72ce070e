//! Declarative validation of JSON request bodies.
//!
//! A [Schema] maps field names to [FieldRule]s and can be written in code or deserialized from
//! JSON, e.g. `{"email": {"required": true, "type": "string"}, "password": {"minLength": 8}}`.
//! [ValidateJson] applies a schema to the body of every request passing through it.

use crate::errors::{FieldErrors, PipelineError};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::web::Bytes;
use actix_web::ResponseError;
use futures::future::{ok, LocalBoxFuture, Ready};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        })
    }
}

/// Constraints on a single body field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRule {
    /// The field must be present and not empty (`null`, `false`, `0` and `""` count as empty).
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<FieldKind>,
    /// Minimum number of characters of a string, or elements of an array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
}

impl FieldRule {
    pub fn optional() -> Self {
        Self::default()
    }

    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn min_length(mut self, min_length: usize) -> Self {
        self.min_length = Some(min_length);
        self
    }

    /// Checks `value` against this rule, returning the message for the first broken constraint.
    ///
    /// Only a present, non-empty value is checked for type and length.
    fn check(&self, field: &str, value: Option<&Value>) -> Option<String> {
        let value = value.filter(|v| is_present(v));
        match value {
            None if self.required => Some(format!("{field} is required")),
            None => None,
            Some(value) => {
                if let Some(kind) = self.kind.filter(|kind| !kind.matches(value)) {
                    return Some(format!("{field} must be a {kind}"));
                }
                match (self.min_length, length(value)) {
                    (Some(min), Some(len)) if len < min => {
                        Some(format!("{field} must be at least {min} characters"))
                    }
                    _ => None,
                }
            }
        }
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// String length in UTF-16 code units, the way browser clients measure it.
fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.encode_utf16().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

/// Field rules for a JSON object body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldRule>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, rule: FieldRule) -> Self {
        self.fields.insert(name.to_owned(), rule);
        self
    }

    /// Validates a parsed body.
    ///
    /// A body that is not a JSON object has none of the fields.
    pub fn validate(&self, body: &Value) -> Result<(), PipelineError> {
        let empty = Map::new();
        let object = body.as_object().unwrap_or(&empty);
        let errors: FieldErrors = self
            .fields
            .iter()
            .filter_map(|(field, rule)| {
                rule.check(field, object.get(field))
                    .map(|message| (field.clone(), message))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::ValidationFailed(errors))
        }
    }

    /// Parses and validates a raw body; an empty body is treated as `{}`.
    pub fn validate_bytes(&self, body: &[u8]) -> Result<(), PipelineError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return self.validate(&Value::Object(Map::new()));
        }
        let value: Value =
            serde_json::from_slice(body).map_err(|_| PipelineError::MalformedBody)?;
        self.validate(&value)
    }
}

/// Request body validation middleware.
///
/// Rejects requests whose JSON body does not satisfy the [Schema] with `400` and a field indexed
/// `errors` object. The body is handed on unchanged to the next stage.
#[derive(Debug, Clone)]
pub struct ValidateJson {
    schema: Rc<Schema>,
}

impl ValidateJson {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Rc::new(schema),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ValidateJson
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = ValidateJsonMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ValidateJsonMiddleware {
            service: Rc::new(service),
            schema: self.schema.clone(),
        })
    }
}

pub struct ValidateJsonMiddleware<S> {
    service: Rc<S>,
    schema: Rc<Schema>,
}

fn bytes_to_payload(buf: Bytes) -> Payload {
    let (_, mut payload) = actix_http::h1::Payload::create(true);
    payload.unread_data(buf);
    Payload::from(payload)
}

impl<S, B> Service<ServiceRequest> for ValidateJsonMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let schema = self.schema.clone();

        Box::pin(async move {
            let body = match req.extract::<Bytes>().await {
                Ok(body) => body,
                Err(e) => return Ok(req.error_response(e).map_into_right_body()),
            };
            if let Err(e) = schema.validate_bytes(&body) {
                log::debug!("Request to {} failed validation: {e}", req.path());
                return Ok(req.into_response(e.error_response()).map_into_right_body());
            }
            req.set_payload(bytes_to_payload(body));
            let response = service.call(req).await?;
            Ok(response.map_into_left_body())
        })
    }
}
