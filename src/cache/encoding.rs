//! Transmission encoding for bodies leaving the cache layer.
//!
//! Stored bodies are always the uncompressed handler output. Everything here
//! happens on the way out: the optional body filter runs first, then gzip if
//! the client accepts it.

use std::io::{self, Write};
use std::sync::Arc;

use axum::http::{HeaderMap, header};
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use tracing::warn;

/// Rewrites a body right before it is transmitted. Never applied to stored bodies.
pub type BodyFilter = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

/// Body ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub body: Bytes,
    pub gzip: bool,
}

/// True when `Accept-Encoding` lists gzip without `q=0`.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|entry| {
            let mut params = entry.split(';').map(str::trim);
            let coding = params.next().unwrap_or_default();
            if !coding.eq_ignore_ascii_case("gzip") && !coding.eq_ignore_ascii_case("x-gzip") {
                return false;
            }
            !params.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            })
        })
}

pub fn gzip(body: &[u8]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    encoder.finish().map(Bytes::from)
}

/// Apply `filter`, then gzip when `compress` is set. A compression failure
/// falls back to the identity encoding.
pub fn encode_for_client(body: Bytes, filter: Option<&BodyFilter>, compress: bool) -> Encoded {
    let body = match filter {
        Some(filter) => filter(body),
        None => body,
    };

    if !compress {
        return Encoded { body, gzip: false };
    }

    match gzip(&body) {
        Ok(compressed) => Encoded {
            body: compressed,
            gzip: true,
        },
        Err(err) => {
            warn!(
                target = "respond_first::cache::encoding",
                op = "encoding::gzip",
                result = "identity_fallback",
                error = %err,
                "Failed to gzip response body"
            );
            Encoded { body, gzip: false }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use axum::http::HeaderValue;
    use flate2::read::GzDecoder;

    use super::*;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(value));
        headers
    }

    fn gunzip(body: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut decoded)
            .expect("valid gzip stream");
        decoded
    }

    #[test]
    fn detects_gzip_in_accept_encoding() {
        assert!(accepts_gzip(&headers("gzip")));
        assert!(accepts_gzip(&headers("br, gzip, deflate")));
        assert!(accepts_gzip(&headers("deflate, GZIP;q=0.5")));
        assert!(!accepts_gzip(&headers("br, deflate")));
        assert!(!accepts_gzip(&headers("gzip;q=0")));
        assert!(!accepts_gzip(&HeaderMap::new()));
    }

    #[test]
    fn filter_runs_before_compression() {
        let filter: BodyFilter = Arc::new(|body: Bytes| {
            let mut text = body.to_vec();
            text.extend_from_slice(b"<!-- cached -->");
            Bytes::from(text)
        });

        let encoded = encode_for_client(Bytes::from_static(b"<p>hi</p>"), Some(&filter), true);

        assert!(encoded.gzip);
        assert_eq!(gunzip(&encoded.body), b"<p>hi</p><!-- cached -->");
    }

    #[test]
    fn identity_when_compression_disabled() {
        let encoded = encode_for_client(Bytes::from_static(b"plain"), None, false);
        assert_eq!(
            encoded,
            Encoded {
                body: Bytes::from_static(b"plain"),
                gzip: false
            }
        );
    }
}
