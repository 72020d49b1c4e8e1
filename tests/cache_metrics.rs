use std::collections::HashSet;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{Method, Request, StatusCode},
    middleware,
    response::Response,
    routing::any,
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use respond_first::cache::{
    CacheConfig, CacheState, CachedEntry, EntryKey, EntryStore, ManualClock, MemoryEntryStore,
    RequestIdentity, StoreError, respond_first_layer,
};
use serial_test::serial;
use tower::ServiceExt;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0)
        .single()
        .expect("valid test instant")
}

/// One recorder per test process; every test in this file shares it.
fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

/// Sum of a counter's increments since the previous snapshot, restricted to
/// series carrying `label`.
fn counter_delta(name: &str, label: (&str, &str)) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            key.name() == name
                && key
                    .labels()
                    .any(|l| l.key() == label.0 && l.value() == label.1)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

/// Reads succeed, writes always fail.
struct ReadOnlyStore;

#[async_trait]
impl EntryStore for ReadOnlyStore {
    async fn get(&self, _key: &EntryKey) -> Result<Option<CachedEntry>, StoreError> {
        Ok(None)
    }

    async fn put(
        &self,
        key: &EntryKey,
        _body: Bytes,
        _stored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Io {
            op: "put",
            key: key.to_string(),
            source: io::Error::other("read-only store"),
        })
    }

    async fn delete(&self, _key: &EntryKey) -> Result<(), StoreError> {
        Ok(())
    }
}

fn app(state: CacheState) -> Router {
    Router::new()
        .route(
            "/{*path}",
            any(|request: Request<Body>| async move {
                match request.uri().path() {
                    "/missing" => (StatusCode::NOT_FOUND, "missing"),
                    _ => (StatusCode::OK, "page"),
                }
            }),
        )
        .layer(middleware::from_fn_with_state(state, respond_first_layer))
}

async fn respond(app: &Router, method: Method, uri: &str) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "example.com")
        .body(Body::empty())
        .expect("request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn send(app: &Router, method: Method, uri: &str) -> StatusCode {
    respond(app, method, uri).await.status()
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let snapshotter = snapshotter();

    let config = CacheConfig {
        ttl: Some(Duration::from_secs(300)),
        ..Default::default()
    };
    let store = Arc::new(MemoryEntryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let state = CacheState::new(config.clone(), store.clone()).with_clock(clock.clone());
    let app = app(state);

    // miss + commit, then fresh
    assert_eq!(send(&app, Method::GET, "/page").await, StatusCode::OK);
    assert_eq!(send(&app, Method::GET, "/page").await, StatusCode::OK);

    // stale + regeneration
    clock.advance(TimeDelta::seconds(400));
    assert_eq!(send(&app, Method::GET, "/page").await, StatusCode::OK);
    let key = RequestIdentity::new("example.com", "/page", None).key();
    for _ in 0..200 {
        let entry = store.get(&key).await.expect("store readable");
        if entry.is_some_and(|entry| entry.stored_at == start() + TimeDelta::seconds(400)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // cancel
    assert_eq!(
        send(&app, Method::GET, "/missing").await,
        StatusCode::NOT_FOUND
    );

    // bypass
    assert_eq!(send(&app, Method::POST, "/page").await, StatusCode::OK);

    // store error fails the miss
    let failing = app_with_store(config, Arc::new(ReadOnlyStore));
    assert_eq!(
        send(&failing, Method::GET, "/page").await,
        StatusCode::INTERNAL_SERVER_ERROR
    );

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "respond_first_fresh_total",
        "respond_first_stale_total",
        "respond_first_miss_total",
        "respond_first_bypass_total",
        "respond_first_commit_total",
        "respond_first_cancel_total",
        "respond_first_store_error_total",
        "respond_first_capture_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

fn app_with_store(config: CacheConfig, store: Arc<dyn EntryStore>) -> Router {
    app(CacheState::new(config, store))
}

/// Holds an old page; every write fails.
struct StaleReadOnlyStore {
    stored_at: DateTime<Utc>,
}

#[async_trait]
impl EntryStore for StaleReadOnlyStore {
    async fn get(&self, _key: &EntryKey) -> Result<Option<CachedEntry>, StoreError> {
        Ok(Some(CachedEntry {
            body: Bytes::from_static(b"old page"),
            stored_at: self.stored_at,
        }))
    }

    async fn put(
        &self,
        key: &EntryKey,
        _body: Bytes,
        _stored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        ReadOnlyStore.put(key, Bytes::new(), self.stored_at).await
    }

    async fn delete(&self, _key: &EntryKey) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
#[serial]
async fn failed_write_after_stale_serve_keeps_stale_reply_and_is_counted() {
    // Drop whatever earlier tests recorded.
    let _ = snapshotter().snapshot();

    let config = CacheConfig {
        ttl: Some(Duration::from_secs(300)),
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::new(start() + TimeDelta::seconds(400)));
    let store = Arc::new(StaleReadOnlyStore { stored_at: start() });
    let app = app(CacheState::new(config, store).with_clock(clock));

    let response = respond(&app, Method::GET, "/page").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache-status"], "STALE");
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    assert_eq!(body, Bytes::from_static(b"old page"));

    // The write happens on the regeneration task.
    let mut failed_puts = 0;
    for _ in 0..200 {
        failed_puts += counter_delta("respond_first_store_error_total", ("op", "put"));
        if failed_puts > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(failed_puts > 0, "failed put after stale serve was not counted");
}
