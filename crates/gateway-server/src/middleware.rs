//! Request middleware.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use gateway_core::RequestId;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::extractors::REQUEST_ID_HEADER;

/// Make sure every request has an `x-request-id` and echo it on the response
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let header = HeaderName::from_static(REQUEST_ID_HEADER);
    let id = match request.headers().get(&header) {
        Some(value) if !value.as_bytes().iter().all(u8::is_ascii_whitespace) => value.clone(),
        _ => {
            let generated = RequestId::generate();
            match HeaderValue::from_str(generated.as_str()) {
                Ok(value) => value,
                Err(_) => return next.run(request).await,
            }
        }
    };
    request.headers_mut().insert(header.clone(), id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(header, id);
    response
}

/// One access log line per request
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}

/// Permissive CORS; the identity layer in front decides who gets through
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
}
