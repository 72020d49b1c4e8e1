//! HTTP surface: the cache layer wrapped around the upstream proxy.

mod middleware;

use axum::{Router, middleware::from_fn, middleware::from_fn_with_state, routing::any};
use tokio::net::TcpListener;
use tracing::info;

use crate::cache::{CacheState, respond_first_layer};
use crate::infra::{error::InfraError, proxy};

pub use middleware::{X_REQUEST_ID, log_responses, set_request_id};

/// Every path is forwarded to the origin through the cache layer.
///
/// Layers run outermost first: request id, response logging, cache.
pub fn build_router(cache: CacheState, upstream: proxy::UpstreamState) -> Router {
    Router::new()
        .route("/", any(proxy::forward))
        .route("/{*path}", any(proxy::forward))
        .with_state(upstream)
        .layer(from_fn_with_state(cache, respond_first_layer))
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_id))
}

/// Serve `router` until Ctrl-C; in-flight requests are allowed to finish.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), InfraError> {
    let addr = listener.local_addr()?;
    info!(
        target = "respond_first::http",
        addr = %addr,
        "Listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| InfraError::server(format!("server error: {err}")))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(
            target = "respond_first::http",
            "Shutdown signal received"
        ),
        // Without a signal handler the server runs until killed.
        Err(_) => std::future::pending::<()>().await,
    }
}
