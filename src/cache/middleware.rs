//! Respond-first cache middleware.
//!
//! Fresh entries are served without touching the handler. Stale entries are
//! answered in full right away while the handler regenerates the entry on a
//! task of its own. Misses run the handler inline and store its output when
//! it is cacheable.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{Instrument, debug, instrument};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::controller::{
    Capture, CaptureBuffer, CaptureOutput, Controller, Lookup, Outcome, RequestContext,
};
use super::encoding::BodyFilter;
use super::headers::{
    CacheStatus, apply_expiry_headers, apply_transport_headers, set_cache_status,
};
use super::schedule::ScheduleError;
use super::staleness::ExpiryPolicy;
use super::store::{EntryStore, FsEntryStore};

const TARGET: &str = "respond_first::cache::middleware";

#[derive(Debug, Error)]
pub enum CacheBuildError {
    #[error("invalid refresh schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("failed to open entry store at `{path}`: {source}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub policy: Arc<ExpiryPolicy>,
    pub store: Arc<dyn EntryStore>,
    pub clock: Arc<dyn Clock>,
    pub filter: Option<BodyFilter>,
}

impl CacheState {
    pub fn new(config: CacheConfig, store: Arc<dyn EntryStore>) -> Self {
        let policy = Arc::new(config.expiry_policy());
        Self {
            config,
            policy,
            store,
            clock: Arc::new(SystemClock),
            filter: None,
        }
    }

    /// State backed by a filesystem store rooted at `config.store_dir`.
    pub fn open(config: CacheConfig) -> Result<Self, CacheBuildError> {
        let store = FsEntryStore::new(config.store_dir.clone()).map_err(|source| {
            CacheBuildError::Store {
                path: config.store_dir.display().to_string(),
                source,
            }
        })?;
        Ok(Self::new(config, Arc::new(store)))
    }

    /// Replace the expiry schedule with one parsed from `source`.
    pub fn with_schedule(mut self, source: &str) -> Result<Self, CacheBuildError> {
        let policy =
            ExpiryPolicy::with_schedule_str(self.config.ttl, Some(source), self.config.timezone)?;
        self.config.schedule = policy.schedule().cloned();
        self.policy = Arc::new(policy);
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_filter(mut self, filter: BodyFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Middleware for respond-first response caching.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn respond_first_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = RequestContext::from_request(&request);
    let controller = Controller::new(cache, ctx);

    match controller.lookup().await {
        Lookup::Bypass => {
            let mut response = next.run(request).await;
            set_cache_status(response.headers_mut(), CacheStatus::Bypass);
            response
        }
        Lookup::Fresh(served) => {
            let (parts, body) = controller.cached_response(&served, CacheStatus::Hit);
            Response::from_parts(parts, Body::from(body))
        }
        Lookup::Stale(served) => {
            let (parts, body) = controller.cached_response(&served, CacheStatus::Stale);
            regenerate(controller, request, next);
            Response::from_parts(parts, Body::from(body))
        }
        Lookup::Miss => serve_miss(controller, request, next).await,
    }
}

/// Run the handler for a stale entry on a spawned task.
///
/// The task starts before the old body is written and runs alongside it, so
/// the new entry may land first. The client never sees this output. A failed
/// store write is logged and counted by the controller.
fn regenerate(controller: Controller, request: Request<Body>, next: Next) {
    let span = tracing::info_span!(
        "regenerate",
        request_id = %controller.context().request_id,
        key = %controller.key()
    );
    tokio::spawn(
        async move {
            let capture = controller.capture(request, next).await;
            let _ = controller.settle(capture.settlement()).await;
        }
        .instrument(span),
    );
}

async fn serve_miss(controller: Controller, request: Request<Body>, next: Next) -> Response {
    let capture = controller.capture(request, next).await;

    let outcome = match controller.settle(capture.settlement()).await {
        Ok(outcome) => outcome,
        // A page that could not be stored; nothing has been sent yet.
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let Capture { output, .. } = capture;
    let mut response = match output {
        CaptureOutput::Buffered(buffer) => miss_response(&controller, buffer, &outcome),
        CaptureOutput::Streaming(response) => response,
        CaptureOutput::Lost => {
            debug!(
                target = TARGET,
                op = "middleware::serve_miss",
                result = "lost",
                request_id = %controller.context().request_id,
                "Handler output unavailable"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };
    set_cache_status(response.headers_mut(), CacheStatus::Miss);
    response
}

/// Hand the captured output to the client. Bodies the handler already encoded
/// go out as they are.
fn miss_response(controller: &Controller, buffer: CaptureBuffer, outcome: &Outcome) -> Response {
    let CaptureBuffer { mut parts, body } = buffer;

    if parts.headers.contains_key(axum::http::header::CONTENT_ENCODING) {
        return Response::from_parts(parts, Body::from(body));
    }

    let encoded = controller.encode(body);
    apply_transport_headers(&mut parts.headers, &encoded);
    if let Outcome::Committed { stored_at } = outcome {
        let decision = controller.decision_at(*stored_at);
        apply_expiry_headers(&mut parts.headers, &decision, *stored_at, *stored_at);
    }

    Response::from_parts(parts, Body::from(encoded.body))
}
