//! Structured API errors for the admin surface and client-input failures.
//! Pipeline admission verdicts are receipts, not ApiErrors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: u64,
}

impl ApiError {
    pub fn new(code: u16, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
            reason: None,
            details: None,
            timestamp: Utc::now().timestamp() as u64,
        }
    }

    /// Machine-readable reason tag, e.g. `SSRF_BLOCKED`.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::new(401, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(404, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(409, message)
    }

    pub fn payload_too_large(message: &str) -> Self {
        Self::new(413, message)
    }

    pub fn internal(message: &str) -> Self {
        Self::new(500, message)
    }

    pub fn service_unavailable(message: &str) -> Self {
        Self::new(503, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API error {}: {}", self.code, self.error)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(&err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(&format!("JSON parsing error: {}", err))
    }
}
