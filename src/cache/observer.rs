//! Response status observer.
//!
//! Once a stale body has been sent, the regenerated response never reaches the
//! client, so nothing the handler does to its status or headers can be
//! reported back. The observer records what the handler settled on and turns
//! anything other than a plain 200 into a cancellation of the pending write.

use std::fmt;

use axum::http::{HeaderMap, StatusCode, header, response::Parts};

/// Why a capture must not be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The handler settled on a status other than 200.
    Status(StatusCode),
    /// The handler asked the client to go elsewhere.
    Redirect,
    /// The response carries per-client state.
    SetCookie,
    /// Streaming responses have no final body to store.
    EventStream,
    /// The body already has a transfer encoding applied.
    Encoded,
    /// The handler never produced a response head.
    StatusUnknown,
    BodyRead(String),
    BodyTooLarge { limit: usize },
    HandlerPanicked,
}

impl CancelReason {
    /// Short machine-readable label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CancelReason::Status(_) => "status",
            CancelReason::Redirect => "redirect",
            CancelReason::SetCookie => "set_cookie",
            CancelReason::EventStream => "event_stream",
            CancelReason::Encoded => "encoded",
            CancelReason::StatusUnknown => "status_unknown",
            CancelReason::BodyRead(_) => "body_read",
            CancelReason::BodyTooLarge { .. } => "body_too_large",
            CancelReason::HandlerPanicked => "handler_panicked",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Status(status) => write!(f, "handler responded with {status}"),
            CancelReason::Redirect => f.write_str("handler issued a redirect"),
            CancelReason::SetCookie => f.write_str("response sets a cookie"),
            CancelReason::EventStream => f.write_str("response is an event stream"),
            CancelReason::Encoded => f.write_str("response body is already content-encoded"),
            CancelReason::StatusUnknown => f.write_str("handler status could not be observed"),
            CancelReason::BodyRead(message) => write!(f, "failed to read handler body: {message}"),
            CancelReason::BodyTooLarge { limit } => {
                write!(f, "handler body exceeds {limit} bytes")
            }
            CancelReason::HandlerPanicked => f.write_str("handler panicked"),
        }
    }
}

/// Streaming bodies never end, so they are neither buffered nor stored.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// Decision consumed by the commit step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Commit,
    Cancel(CancelReason),
}

/// Tracks the handler's terminal status and any cancellation signal.
///
/// The first cancellation wins; later signals never clear it.
#[derive(Debug, Default, Clone)]
pub struct StatusObserver {
    status: Option<StatusCode>,
    cancelled: Option<CancelReason>,
}

impl StatusObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the response head the handler settled on.
    pub fn observe_head(&mut self, parts: &Parts) {
        self.status = Some(parts.status);

        if parts.status.is_redirection() || parts.headers.contains_key(header::LOCATION) {
            self.cancel(CancelReason::Redirect);
        } else if parts.status != StatusCode::OK {
            self.cancel(CancelReason::Status(parts.status));
        }

        if parts.headers.contains_key(header::SET_COOKIE) {
            self.cancel(CancelReason::SetCookie);
        }

        if is_event_stream(&parts.headers) {
            self.cancel(CancelReason::EventStream);
        }

        if parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| !value.trim().eq_ignore_ascii_case("identity"))
        {
            self.cancel(CancelReason::Encoded);
        }
    }

    /// Record a failure that happened after the head was observed.
    pub fn cancel(&mut self, reason: CancelReason) {
        if self.cancelled.is_none() {
            self.cancelled = Some(reason);
        }
    }

    /// Commit only with an explicitly observed 200 and no cancellation.
    pub fn verdict(&self) -> Verdict {
        match (&self.cancelled, self.status) {
            (Some(reason), _) => Verdict::Cancel(reason.clone()),
            (None, Some(StatusCode::OK)) => Verdict::Commit,
            (None, Some(status)) => Verdict::Cancel(CancelReason::Status(status)),
            (None, None) => Verdict::Cancel(CancelReason::StatusUnknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Response;

    use super::*;

    fn parts(status: StatusCode, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn observe(status: StatusCode, headers: &[(&str, &str)]) -> Verdict {
        let mut observer = StatusObserver::new();
        observer.observe_head(&parts(status, headers));
        observer.verdict()
    }

    #[test]
    fn plain_ok_commits() {
        assert_eq!(
            observe(StatusCode::OK, &[("content-type", "text/html")]),
            Verdict::Commit
        );
    }

    #[test]
    fn other_success_statuses_cancel() {
        assert_eq!(
            observe(StatusCode::NO_CONTENT, &[]),
            Verdict::Cancel(CancelReason::Status(StatusCode::NO_CONTENT))
        );
    }

    #[test]
    fn errors_cancel() {
        assert_eq!(
            observe(StatusCode::NOT_FOUND, &[]),
            Verdict::Cancel(CancelReason::Status(StatusCode::NOT_FOUND))
        );
        assert_eq!(
            observe(StatusCode::INTERNAL_SERVER_ERROR, &[]),
            Verdict::Cancel(CancelReason::Status(StatusCode::INTERNAL_SERVER_ERROR))
        );
    }

    #[test]
    fn redirects_cancel_even_with_ok_status() {
        assert_eq!(
            observe(StatusCode::FOUND, &[("location", "/login")]),
            Verdict::Cancel(CancelReason::Redirect)
        );
        assert_eq!(
            observe(StatusCode::OK, &[("location", "/elsewhere")]),
            Verdict::Cancel(CancelReason::Redirect)
        );
    }

    #[test]
    fn per_client_and_streaming_responses_cancel() {
        assert_eq!(
            observe(StatusCode::OK, &[("set-cookie", "session=1")]),
            Verdict::Cancel(CancelReason::SetCookie)
        );
        assert_eq!(
            observe(StatusCode::OK, &[("content-type", "text/event-stream")]),
            Verdict::Cancel(CancelReason::EventStream)
        );
        assert_eq!(
            observe(StatusCode::OK, &[("content-encoding", "br")]),
            Verdict::Cancel(CancelReason::Encoded)
        );
    }

    #[test]
    fn first_cancellation_wins() {
        let mut observer = StatusObserver::new();
        observer.observe_head(&parts(StatusCode::OK, &[]));
        observer.cancel(CancelReason::BodyTooLarge { limit: 10 });
        observer.cancel(CancelReason::HandlerPanicked);

        assert_eq!(
            observer.verdict(),
            Verdict::Cancel(CancelReason::BodyTooLarge { limit: 10 })
        );
    }

    #[test]
    fn missing_status_fails_closed() {
        assert_eq!(
            StatusObserver::new().verdict(),
            Verdict::Cancel(CancelReason::StatusUnknown)
        );
    }
}
