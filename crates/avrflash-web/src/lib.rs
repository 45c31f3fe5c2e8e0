// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! HTTP surface of the firmware updater

mod events;
mod update_api;

pub use update_api::{ApiError, ErrorResponse, StatusResponse, ToggleResponse, UploadRequest};

use avrflash_core::config::WebSettings;
use avrflash_core::{SettingsStore, Updater};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state for web handlers
#[derive(Clone, Debug)]
pub struct AppState {
    pub updater: Updater,
    pub settings: Arc<SettingsStore>,
}

/// Build the router; `upload_limit` is the request body ceiling in bytes
pub fn router(state: AppState, upload_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(update_api::status_handler))
        .route("/api/events", get(events::events_handler))
        .route("/api/update", post(update_api::update_handler))
        .route("/api/upload", post(update_api::upload_handler))
        .route(
            "/api/auto-update/toggle",
            post(update_api::toggle_auto_update_handler),
        )
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request body ceiling in bytes for the configured upload limit
pub fn upload_limit_bytes(settings: &WebSettings) -> usize {
    settings.upload_limit_mb.saturating_mul(1024 * 1024)
}

/// Serve the API until `shutdown` resolves
///
/// # Errors
/// Returns error if the server fails to bind or serve
pub async fn start_web_server(
    state: AppState,
    settings: &WebSettings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state, upload_limit_bytes(settings));

    let addr = format!("{}:{}", settings.bind_address, settings.port);
    info!("Starting web server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Web server stopped");
    Ok(())
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
