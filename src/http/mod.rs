//! HTTP surface for monitoring and session control.
//!
//! Exposes the [`MonitoringContext`] through an axum router. Handlers
//! never hold engine locks across an await; all state lives in the
//! context shared via `Arc`.

mod error;
mod handlers;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use error::ApiError;

use crate::monitor::MonitoringContext;
use crate::{AppError, Result};

/// Handler for `GET /health`: 200 with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

/// Build the router over a shared context.
pub fn router(ctx: Arc<MonitoringContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/projects/{id}/monitoring",
            get(handlers::get_monitoring)
                .post(handlers::post_monitoring)
                .put(handlers::put_monitoring)
                .delete(handlers::delete_monitoring),
        )
        .with_state(ctx)
}

/// Bind `bind` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the address cannot be bound and
/// `AppError::Io` if the server fails while running.
pub async fn serve(ctx: Arc<MonitoringContext>, bind: &str, ct: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;
    serve_listener(listener, ctx, ct).await
}

/// Serve on an already bound listener until `ct` is cancelled.
///
/// In-flight requests are drained before this returns.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails while running.
pub async fn serve_listener(
    listener: TcpListener,
    ctx: Arc<MonitoringContext>,
    ct: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP server shut down");
    Ok(())
}
