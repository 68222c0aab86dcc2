//! `hatch serve` -- scheduler plus a JSON admin API.
//!
//! The scheduler ticks every configured application in the background while
//! `axum` serves the admin endpoints. Both stop on Ctrl+C.
//!
//! Endpoints:
//! - GET  /health                         - Server status and applications
//! - GET  /experiments/{slug}             - Experiment record
//! - GET  /experiments/{slug}/changelog   - Experiment history
//! - POST /experiments                    - Create a DRAFT experiment
//! - POST /experiments/{slug}/transition  - Request a lifecycle change
//! - POST /applications/{app}/reconcile   - Run one publish and liveness tick
//!
//! Errors are `{"error": "..."}` with 422 for rejected input, 404 for
//! unknown experiments or applications, 409 for conflicts and 502 when the
//! remote store fails. There is no authentication.

mod handlers;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_create, handle_get_changelog, handle_get_experiment, handle_health, handle_not_found,
    handle_reconcile, handle_transition,
};
use self::state::AppState;
use crate::context::Context;

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Actor recorded for changes made through the API without an explicit one.
const DEFAULT_API_ACTOR: &str = "admin-api";

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/experiments", post(handle_create))
        .route("/experiments/{slug}", get(handle_get_experiment))
        .route("/experiments/{slug}/changelog", get(handle_get_changelog))
        .route("/experiments/{slug}/transition", post(handle_transition))
        .route("/applications/{app}/reconcile", post(handle_reconcile))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Run the scheduler and the admin API on `port` until Ctrl+C.
pub(crate) async fn start_server(ctx: Context, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = ctx.scheduler();
    let state = Arc::new(AppState::new(ctx));
    let app = router(state);

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler_task = {
        let stop = stop_rx.clone();
        tokio::spawn(async move { scheduler.run(stopped(stop)).await })
    };

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "hatch admin API listening");

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(stopped(stop_rx))
        .await?;
    scheduler_task.await?;

    tracing::info!("server shut down");
    Ok(())
}

/// Resolves once a stop has been signalled.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
