//! Custom Axum extractors for the gateway.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::request::Parts,
};
use gateway_core::RequestId as CoreRequestId;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ApiError;

/// Header carrying the request ID in both directions
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header naming the caller; overrides `callerId` in the body
pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Request ID from `x-request-id`, or a fresh one
#[derive(Debug, Clone)]
pub struct RequestId(pub CoreRequestId);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .or_else(|| parts.headers.get("x-correlation-id"))
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map_or_else(CoreRequestId::generate, CoreRequestId::from_external);

        Ok(Self(id))
    }
}

/// Caller identity from `x-caller-id`, if present
#[derive(Debug, Clone)]
pub struct CallerHeader(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for CallerHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(CALLER_ID_HEADER) else {
            return Ok(Self(None));
        };
        let caller = value
            .to_str()
            .map_err(|_| ApiError::bad_request("x-caller-id must be visible ASCII"))?
            .trim();

        Ok(Self(Some(caller.to_string()).filter(|c| !c.is_empty())))
    }
}

/// JSON body extractor that answers malformed input with `INVALID_REQUEST`
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> axum::extract::FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read request body: {e}")))?;

        let value: T = serde_json::from_slice(&bytes).map_err(|e| {
            debug!(error = %e, "JSON parse error");
            ApiError::bad_request(format!("Invalid JSON: {e}"))
        })?;

        Ok(Self(value))
    }
}
