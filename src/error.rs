//! API error taxonomy.
//!
//! The code strings are part of the wire contract and must not change.
//! Internal failures always surface the same fixed message; their detail goes
//! to the log, keyed by request id, never to the caller.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::rlog_kv;
use crate::storage::StorageError;

const INTERNAL_MESSAGE: &str = "internal error";

#[derive(Debug)]
pub enum ApiError {
    /// 401: missing or invalid caller token.
    AuthFailed,
    /// 403: authenticated but not permitted.
    Forbidden(String),
    /// 404: missing resource.
    NotFound(String),
    /// 400: schema or semantic validation failure, with field-level detail.
    Validation(Vec<String>),
    /// 400: duplicate resource (message id or other unique key replay).
    Duplicate(String),
    /// 429 with a Retry-After hint in seconds.
    RateLimited { retry_after_secs: u64 },
    /// 400: too many devices registered for one DID.
    DeviceLimitExceeded,
    /// 400: a jar would grow past the member cap.
    CircleLimitExceeded,
    /// 500: everything else; detail is logged, not returned.
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(vec![message.into()])
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthFailed => "AUTH_FAILED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Validation(_) | ApiError::Duplicate(_) => "VALIDATION_ERROR",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::DeviceLimitExceeded => "DEVICE_LIMIT_EXCEEDED",
            ApiError::CircleLimitExceeded => "CIRCLE_LIMIT_EXCEEDED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthFailed => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_)
            | ApiError::Duplicate(_)
            | ApiError::DeviceLimitExceeded
            | ApiError::CircleLimitExceeded => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::AuthFailed => "authentication required".to_string(),
            ApiError::Forbidden(message) => message.clone(),
            ApiError::NotFound(what) => format!("{what} not found"),
            ApiError::Validation(problems) => match problems.as_slice() {
                [single] => single.clone(),
                _ => "request validation failed".to_string(),
            },
            ApiError::Duplicate(what) => format!("duplicate {what}"),
            ApiError::RateLimited { .. } => "rate limit exceeded".to_string(),
            ApiError::DeviceLimitExceeded => "device limit exceeded".to_string(),
            ApiError::CircleLimitExceeded => "jar member limit exceeded".to_string(),
            ApiError::Internal(_) => INTERNAL_MESSAGE.to_string(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let ApiError::Internal(detail) = &self {
            rlog_kv!(
                Error,
                json!({"code": self.code(), "status": status.as_u16()}),
                "internal error: {detail}"
            );
        }

        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        if let ApiError::Validation(problems) = &self {
            body["error"]["details"] = json!(problems);
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
