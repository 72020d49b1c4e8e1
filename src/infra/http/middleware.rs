use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::X_CACHE_STATUS;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Tag the request with an id, reusing the one the client sent if any, and
/// echo it on the response.
pub async fn set_request_id(mut request: Request<Body>, next: Next) -> Response {
    let request_id = match request.headers().get(&X_REQUEST_ID) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(request).await,
        },
    };
    request
        .headers_mut()
        .insert(X_REQUEST_ID, request_id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(X_REQUEST_ID, request_id);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let cache_status = response
        .headers()
        .get(X_CACHE_STATUS)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if status.is_server_error() {
        error!(
            target = "respond_first::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            cache = %cache_status,
            request_id = %request_id,
            "request failed",
        );
    } else if status.is_client_error() {
        warn!(
            target = "respond_first::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms,
            cache = %cache_status,
            request_id = %request_id,
            "client request error",
        );
    } else {
        info!(
            target = "respond_first::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            cache = %cache_status,
            request_id = %request_id,
            "request served",
        );
    }

    response
}
