//! HTTP error responses.
//!
//! Every failure leaves the server as `{"error": {"code", "message", "retriable"}}`
//! with a status derived from the stable error code.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::{ErrorBody, ErrorCode, GatewayError};
use serde::Serialize;
use std::time::Duration;

/// Status used when the caller disconnected before a response existed
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Error returned by handlers and extractors
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether the caller may retry
    pub retriable: bool,
    /// Value for the `Retry-After` header
    pub retry_after: Option<Duration>,
}

#[derive(Serialize)]
struct Envelope {
    error: ErrorBody,
}

impl ApiError {
    /// Build an error from its parts
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            status: status_for(code),
            code,
            message: message.into(),
            retriable,
            retry_after: None,
        }
    }

    /// 400 with `INVALID_REQUEST`
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, false)
    }

    /// 500 with `INTERNAL_ERROR`
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, false)
    }

    /// Attach a `Retry-After` hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Wire body
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.message.clone(),
            retriable: self.retriable,
        }
    }
}

/// HTTP status for an error code
#[must_use]
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::QueueTimeout | ErrorCode::CircuitOpen | ErrorCode::AllProvidersUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::ProtocolError | ErrorCode::ProviderError => StatusCode::BAD_GATEWAY,
        ErrorCode::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        let mut api = Self::new(error.code(), error.to_string(), error.client_retriable());
        api.retry_after = error.retry_after();
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = Envelope { error: self.body() };
        let mut response = (self.status, Json(envelope)).into_response();

        if let Some(retry_after) = self.retry_after {
            // whole seconds, rounded up so callers never retry early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
