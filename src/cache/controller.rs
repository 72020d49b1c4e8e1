//! Serve/store controller.
//!
//! One controller drives one request through
//! `LOOKUP -> {FRESH, STALE, MISS} -> CAPTURING -> {COMMIT, CANCEL}`.
//! The middleware decides what reaches the client; the controller owns every
//! interaction with the entry store.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use axum::{
    body::{Body, HttpBody},
    http::{HeaderValue, Method, Request, header, response::Parts},
    middleware::Next,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use http_body_util::BodyExt;
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::encoding::{Encoded, accepts_gzip, encode_for_client};
use super::headers::{
    CacheStatus, apply_close, apply_expiry_headers, apply_transport_headers, set_cache_status,
};
use super::keys::{EntryKey, RequestIdentity};
use super::middleware::CacheState;
use super::observer::{CancelReason, StatusObserver, Verdict, is_event_stream};
use super::staleness::StalenessDecision;
use super::store::{CachedEntry, StoreError};

const TARGET: &str = "respond_first::cache::controller";

pub(crate) const METRIC_FRESH_TOTAL: &str = "respond_first_fresh_total";
pub(crate) const METRIC_STALE_TOTAL: &str = "respond_first_stale_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "respond_first_miss_total";
pub(crate) const METRIC_BYPASS_TOTAL: &str = "respond_first_bypass_total";
pub(crate) const METRIC_COMMIT_TOTAL: &str = "respond_first_commit_total";
pub(crate) const METRIC_CANCEL_TOTAL: &str = "respond_first_cancel_total";
pub(crate) const METRIC_STORE_ERROR_TOTAL: &str = "respond_first_store_error_total";
pub(crate) const METRIC_CAPTURE_MS: &str = "respond_first_capture_ms";

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything the controller needs to know about the incoming request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub identity: RequestIdentity,
    pub accepts_gzip: bool,
}

impl RequestContext {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request_id,
            method: request.method().clone(),
            identity: RequestIdentity::from_request(request),
            accepts_gzip: accepts_gzip(request.headers()),
        }
    }
}

/// A stored entry together with its verdict at lookup time.
#[derive(Debug, Clone)]
pub struct Served {
    pub entry: CachedEntry,
    pub decision: StalenessDecision,
    pub now: DateTime<Utc>,
}

/// Result of the lookup step.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Not eligible; the entry (if any) has been invalidated.
    Bypass,
    Fresh(Served),
    Stale(Served),
    Miss,
}

/// Buffered handler output.
#[derive(Debug)]
pub struct CaptureBuffer {
    pub parts: Parts,
    pub body: Bytes,
}

/// What became of the handler's output.
#[derive(Debug)]
pub enum CaptureOutput {
    Buffered(CaptureBuffer),
    /// A response that must not be buffered, returned untouched.
    Streaming(axum::response::Response),
    /// The handler panicked or its body could not be read.
    Lost,
}

#[derive(Debug)]
pub struct Capture {
    pub observer: StatusObserver,
    pub output: CaptureOutput,
}

impl Capture {
    /// Store operation this capture calls for. A commit verdict without a
    /// buffered body cannot be stored.
    pub fn settlement(&self) -> Settlement {
        match (self.observer.verdict(), &self.output) {
            (Verdict::Commit, CaptureOutput::Buffered(buffer)) => {
                Settlement::Commit(buffer.body.clone())
            }
            (Verdict::Commit, _) => Settlement::Cancel(CancelReason::StatusUnknown),
            (Verdict::Cancel(reason), _) => Settlement::Cancel(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Commit(Bytes),
    Cancel(CancelReason),
}

/// How the commit step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed { stored_at: DateTime<Utc> },
    Cancelled(CancelReason),
}

pub struct Controller {
    state: CacheState,
    ctx: RequestContext,
    key: EntryKey,
}

impl Controller {
    pub fn new(state: CacheState, ctx: RequestContext) -> Self {
        let key = ctx.identity.key();
        Self { state, ctx, key }
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Decide how the request is served.
    ///
    /// Non-GET requests never read an entry; they delete it so that the next
    /// GET regenerates.
    pub async fn lookup(&self) -> Lookup {
        if self.ctx.method != Method::GET {
            counter!(METRIC_BYPASS_TOTAL).increment(1);
            if let Err(err) = self.state.store.delete(&self.key).await {
                self.report_store_error("invalidate", &err);
            } else {
                debug!(
                    target = TARGET,
                    op = "controller::lookup",
                    result = "invalidated",
                    request_id = %self.ctx.request_id,
                    method = %self.ctx.method,
                    key = %self.key,
                    "Non-GET request invalidated entry"
                );
            }
            return Lookup::Bypass;
        }

        let entry = match self.state.store.get(&self.key).await {
            Ok(entry) => entry,
            Err(err) => {
                self.report_store_error("get", &err);
                None
            }
        };

        let Some(entry) = entry else {
            counter!(METRIC_MISS_TOTAL).increment(1);
            debug!(
                target = TARGET,
                op = "controller::lookup",
                result = "miss",
                request_id = %self.ctx.request_id,
                key = %self.key,
                "No entry stored"
            );
            return Lookup::Miss;
        };

        let now = self.state.clock.now();
        let decision = self.state.policy.evaluate(entry.stored_at, now);
        let served = Served {
            entry,
            decision,
            now,
        };

        if decision.is_stale {
            counter!(METRIC_STALE_TOTAL).increment(1);
            debug!(
                target = TARGET,
                op = "controller::lookup",
                result = "stale",
                request_id = %self.ctx.request_id,
                key = %self.key,
                stored_at = %served.entry.stored_at,
                "Serving stale entry before regenerating"
            );
            Lookup::Stale(served)
        } else {
            counter!(METRIC_FRESH_TOTAL).increment(1);
            debug!(
                target = TARGET,
                op = "controller::lookup",
                result = "fresh",
                request_id = %self.ctx.request_id,
                key = %self.key,
                "Serving fresh entry"
            );
            Lookup::Fresh(served)
        }
    }

    /// Response for a stored body, handler not involved.
    pub fn cached_response(&self, served: &Served, status: CacheStatus) -> (Parts, Bytes) {
        let encoded = self.encode(served.entry.body.clone());

        let (mut parts, ()) = axum::http::Response::new(()).into_parts();
        parts.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&self.state.config.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("text/html; charset=utf-8")),
        );
        apply_transport_headers(&mut parts.headers, &encoded);
        apply_expiry_headers(
            &mut parts.headers,
            &served.decision,
            served.entry.stored_at,
            served.now,
        );
        apply_close(&mut parts.headers);
        set_cache_status(&mut parts.headers, status);

        (parts, encoded.body)
    }

    /// Run the handler and buffer its output.
    ///
    /// Panics, body failures and oversized bodies end up as cancellation
    /// reasons on the observer; they never escape.
    pub async fn capture(&self, request: Request<Body>, next: Next) -> Capture {
        let started_at = Instant::now();
        let mut observer = StatusObserver::new();

        let output = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
            Err(_) => {
                observer.cancel(CancelReason::HandlerPanicked);
                CaptureOutput::Lost
            }
            Ok(response) => {
                let (parts, body) = response.into_parts();
                observer.observe_head(&parts);

                if is_event_stream(&parts.headers) {
                    CaptureOutput::Streaming(axum::response::Response::from_parts(parts, body))
                } else {
                    self.buffer(parts, body, &mut observer).await
                }
            }
        };

        histogram!(METRIC_CAPTURE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        Capture { observer, output }
    }

    /// Read the body up to the configured limit.
    ///
    /// Past the limit the capture is cancelled and the response is handed
    /// back as a stream that replays what was read, then the rest.
    async fn buffer(
        &self,
        parts: Parts,
        mut body: Body,
        observer: &mut StatusObserver,
    ) -> CaptureOutput {
        let limit = self.state.config.body_limit_bytes;

        let declared = body.size_hint().exact().or_else(|| content_length(&parts));
        if declared.is_some_and(|len| len > u64::try_from(limit).unwrap_or(u64::MAX)) {
            observer.cancel(CancelReason::BodyTooLarge { limit });
            return CaptureOutput::Streaming(axum::response::Response::from_parts(parts, body));
        }

        let mut buffered = BytesMut::new();
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    observer.cancel(CancelReason::BodyRead(err.to_string()));
                    return CaptureOutput::Lost;
                }
            };
            // Trailers are not kept.
            let Ok(data) = frame.into_data() else {
                continue;
            };

            if buffered.len() + data.len() > limit {
                observer.cancel(CancelReason::BodyTooLarge { limit });
                buffered.extend_from_slice(&data);
                let replay = replay(buffered.freeze(), body);
                return CaptureOutput::Streaming(axum::response::Response::from_parts(
                    parts, replay,
                ));
            }
            buffered.extend_from_slice(&data);
        }

        CaptureOutput::Buffered(CaptureBuffer {
            parts,
            body: buffered.freeze(),
        })
    }

    /// Commit the capture or erase the entry, as the observer decides.
    ///
    /// Only a failed commit is an error. A failed erase is logged and counted.
    pub async fn settle(&self, settlement: Settlement) -> Result<Outcome, StoreError> {
        match settlement {
            Settlement::Commit(body) => {
                let stored_at = self.state.clock.now();
                if let Err(err) = self.state.store.put(&self.key, body, stored_at).await {
                    self.report_store_error("put", &err);
                    return Err(err);
                }
                counter!(METRIC_COMMIT_TOTAL).increment(1);
                info!(
                    target = TARGET,
                    op = "controller::settle",
                    result = "committed",
                    request_id = %self.ctx.request_id,
                    key = %self.key,
                    identity = %self.ctx.identity,
                    "Captured response stored"
                );
                Ok(Outcome::Committed { stored_at })
            }
            Settlement::Cancel(reason) => {
                counter!(METRIC_CANCEL_TOTAL, "reason" => reason.label()).increment(1);
                warn!(
                    target = TARGET,
                    op = "controller::settle",
                    result = "cancelled",
                    request_id = %self.ctx.request_id,
                    key = %self.key,
                    reason = reason.label(),
                    detail = %reason,
                    "Capture discarded, entry removed"
                );
                // The handler's answer stands even when the old entry lingers.
                if let Err(err) = self.state.store.delete(&self.key).await {
                    self.report_store_error("delete", &err);
                }
                Ok(Outcome::Cancelled(reason))
            }
        }
    }

    /// Apply the body filter and, when the client accepts it, gzip.
    pub fn encode(&self, body: Bytes) -> Encoded {
        encode_for_client(
            body,
            self.state.filter.as_ref(),
            self.state.config.compression && self.ctx.accepts_gzip,
        )
    }

    /// Verdict on a body just written at `stored_at`, for response headers.
    pub fn decision_at(&self, stored_at: DateTime<Utc>) -> StalenessDecision {
        self.state.policy.evaluate(stored_at, stored_at)
    }

    fn report_store_error(&self, op: &'static str, err: &StoreError) {
        counter!(METRIC_STORE_ERROR_TOTAL, "op" => op).increment(1);
        error!(
            target = TARGET,
            op = "controller::store",
            result = "error",
            store_op = op,
            request_id = %self.ctx.request_id,
            key = %self.key,
            error = %err,
            "Entry store operation failed"
        );
    }
}

fn content_length(parts: &Parts) -> Option<u64> {
    parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// A body yielding `head` and then whatever `rest` still has.
fn replay(head: Bytes, mut rest: Body) -> Body {
    Body::from_stream(async_stream::stream! {
        yield Ok::<_, axum::Error>(head);
        while let Some(frame) = rest.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        yield Ok(data);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    })
}
