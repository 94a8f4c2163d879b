// src/api/helpers.rs

use actix_web::HttpResponse;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::ToSchema;

use crate::errors::{AppError, Result};

/// Upper bound on an accepted JSON request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Plain `{"error", "message"}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JsonResponse {
    pub error: bool,
    pub message: String,
}

impl JsonResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            error: false,
            message: message.into(),
        }
    }
}

/// Success envelope with `value` attached under `key`.
pub fn ok_with<T: Serialize>(message: &str, key: &str, value: &T) -> HttpResponse {
    let mut body = json!({ "error": false, "message": message });
    if let (Some(obj), Ok(v)) = (body.as_object_mut(), serde_json::to_value(value)) {
        obj.insert(key.to_string(), v);
    }
    HttpResponse::Ok().json(body)
}

/// Decodes exactly one JSON value from `body`. Anything after the first value,
/// including a second object, is rejected before the fields are looked at.
pub fn read_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.len() > MAX_BODY_BYTES {
        return Err(AppError::Validation(format!(
            "body must not be larger than {MAX_BODY_BYTES} bytes"
        )));
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::Validation("body must not be empty".into()));
    }

    let mut values = serde_json::Deserializer::from_slice(body).into_iter::<Value>();
    let first = match values.next() {
        Some(Ok(v)) => v,
        Some(Err(e)) => return Err(AppError::Validation(format!("body contains badly-formed JSON: {e}"))),
        None => return Err(AppError::Validation("body must not be empty".into())),
    };
    if values.next().is_some() {
        return Err(AppError::Validation(
            "body must only have a single JSON value".into(),
        ));
    }

    serde_json::from_value(first)
        .map_err(|e| AppError::Validation(format!("body contains an invalid field: {e}")))
}

/// Lenient integer parse for form fields that arrive as strings.
pub fn parse_int<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::Validation(format!("{field} must be a whole number")))
}
