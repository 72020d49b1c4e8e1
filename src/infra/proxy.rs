//! Upstream origin forwarding.
//!
//! The handler behind the cache layer: every request is replayed against the
//! configured origin and the origin's answer is relayed as-is.

use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamSettings;

use super::error::InfraError;

const TARGET: &str = "respond_first::infra::proxy";
const MAX_FORWARDED_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Hop-by-hop headers are meaningful for one connection only.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct UpstreamState {
    client: reqwest::Client,
    origin: Url,
}

impl UpstreamState {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            origin: settings.url.clone(),
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Origin URL for a request path, keeping any path prefix of the origin.
    pub fn target_for(&self, uri: &Uri) -> Url {
        let mut target = self.origin.clone();
        let prefix = self.origin.path().trim_end_matches('/');
        target.set_path(&format!("{prefix}{}", uri.path()));
        target.set_query(uri.query());
        target
    }
}

/// Forward a request to the origin and relay the response.
pub async fn forward(State(upstream): State<UpstreamState>, request: Request<Body>) -> Response {
    let started_at = Instant::now();
    let (parts, body) = request.into_parts();
    let target = upstream.target_for(&parts.uri);

    let body = match axum::body::to_bytes(body, MAX_FORWARDED_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            warn!(
                target = TARGET,
                op = "proxy::forward",
                result = "request_body_error",
                error = %err,
                "Failed to read request body"
            );
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let mut headers = forwardable(&parts.headers);
    // Stored bodies must stay uncompressed, so the origin never sees the
    // client's encodings.
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let result = upstream
        .client
        .request(parts.method.clone(), target.clone())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let mut origin = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(
                target = TARGET,
                op = "proxy::forward",
                result = "upstream_error",
                method = %parts.method,
                url = %target,
                error = %err,
                "Upstream request failed"
            );
            return (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response();
        }
    };

    debug!(
        target = TARGET,
        op = "proxy::forward",
        result = "relayed",
        method = %parts.method,
        url = %target,
        status = origin.status().as_u16(),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Upstream responded"
    );

    let status = origin.status();
    let headers = forwardable(origin.headers());
    let stream = async_stream::stream! {
        loop {
            match origin.chunk().await {
                Ok(Some(chunk)) => yield Ok(chunk),
                Ok(None) => break,
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP.iter() {
        forwarded.remove(name);
    }
    forwarded
}
