//! Entry key derivation.
//!
//! A request is identified by host, path and query string; the scheme is
//! ignored. The canonical identity is hashed with SHA-256 and the hex digest
//! is split into a two-character shard prefix and the remainder.

use std::fmt;

use axum::http::{Request, Uri, header};
use sha2::{Digest, Sha256};
use url::Url;

/// The parts of a request that select a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    host: String,
    path: String,
    query: Option<String>,
}

impl RequestIdentity {
    pub fn new(host: impl Into<String>, path: impl Into<String>, query: Option<&str>) -> Self {
        let path = path.into();
        Self {
            host: host.into().to_ascii_lowercase(),
            path: if path.is_empty() { "/".to_string() } else { path },
            query: query.filter(|query| !query.is_empty()).map(str::to_string),
        }
    }

    /// Identity of an incoming request. The `Host` header wins over the URI
    /// authority, matching what the client actually asked for.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| authority(request.uri()))
            .unwrap_or_default();

        Self::new(host, request.uri().path(), request.uri().query())
    }

    pub fn from_url(url: &Url) -> Self {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        Self::new(host, url.path(), url.query())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `host/path?query`, the string that gets hashed.
    pub fn canonical(&self) -> String {
        match &self.query {
            Some(query) => format!("{}{}?{}", self.host, self.path, query),
            None => format!("{}{}", self.host, self.path),
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::digest(&self.canonical())
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn authority(uri: &Uri) -> Option<String> {
    uri.authority().map(|authority| authority.as_str().to_string())
}

/// Hex-encoded SHA-256 digest of a canonical request identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey(String);

impl EntryKey {
    const SHARD_LEN: usize = 2;

    pub fn digest(canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(prefix, remainder)` where the prefix is the first byte of the digest.
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(Self::SHARD_LEN)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
