//! Response headers emitted by the cache layer.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use chrono::{DateTime, Utc};

use super::encoding::Encoded;
use super::staleness::StalenessDecision;

/// Reports how the cache layer handled the request.
pub const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh entry served, handler skipped.
    Hit,
    /// Stale entry served, handler regenerating in the background of the response.
    Stale,
    /// No entry; handler output served and captured.
    Miss,
    /// Request not eligible for caching.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

pub fn set_cache_status(headers: &mut HeaderMap, status: CacheStatus) {
    headers.insert(X_CACHE_STATUS, HeaderValue::from_static(status.as_str()));
}

/// `Cache-Control` and `Expires` derived from the entry's effective lifetime.
/// Nothing is emitted when neither the TTL nor the schedule bounds the entry.
pub fn apply_expiry_headers(
    headers: &mut HeaderMap,
    decision: &StalenessDecision,
    stored_at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let (Some(max_age), Some(expires_at)) = (
        decision.max_age(stored_at, now),
        decision.expires_at(stored_at),
    ) else {
        return;
    };

    if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", max_age.as_secs())) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(expires_at)) {
        headers.insert(header::EXPIRES, value);
    }
    headers.remove(header::PRAGMA);
}

/// Length and encoding of the body actually transmitted.
pub fn apply_transport_headers(headers: &mut HeaderMap, encoded: &Encoded) {
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(encoded.body.len()));
    if encoded.gzip {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
    } else {
        headers.remove(header::CONTENT_ENCODING);
    }
}

/// Cached bodies are complete once sent; the connection is not reused.
pub fn apply_close(headers: &mut HeaderMap) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
}

/// IMF-fixdate as used by `Expires`.
pub fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, TimeZone};

    use super::*;

    fn stored_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0)
            .single()
            .expect("valid test instant")
    }

    #[test]
    fn expiry_headers_reflect_remaining_lifetime() {
        let decision = StalenessDecision {
            is_stale: false,
            effective_ttl: Some(Duration::from_secs(300)),
            next_refresh: None,
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));

        apply_expiry_headers(
            &mut headers,
            &decision,
            stored_at(),
            stored_at() + TimeDelta::seconds(200),
        );

        assert_eq!(headers[header::CACHE_CONTROL], "max-age=100");
        assert_eq!(headers[header::EXPIRES], "Wed, 15 May 2024 10:05:00 GMT");
        assert!(!headers.contains_key(header::PRAGMA));
    }

    #[test]
    fn no_expiry_headers_without_lifetime() {
        let decision = StalenessDecision {
            is_stale: false,
            effective_ttl: None,
            next_refresh: None,
        };
        let mut headers = HeaderMap::new();

        apply_expiry_headers(&mut headers, &decision, stored_at(), stored_at());

        assert!(headers.is_empty());
    }

    #[test]
    fn transport_headers_describe_encoded_body() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));

        apply_transport_headers(
            &mut headers,
            &Encoded {
                body: bytes::Bytes::from_static(b"12345"),
                gzip: true,
            },
        );

        assert_eq!(headers[header::CONTENT_LENGTH], "5");
        assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
        assert_eq!(headers[header::VARY], "accept-encoding");
    }
}
