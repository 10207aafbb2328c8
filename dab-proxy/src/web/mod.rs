//! HTTP server wiring.

pub mod api;
pub mod error;
pub mod state;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Devices
        .route("/devices", get(api::get_devices))
        .route("/devices/probe", post(api::probe_devices))
        .route("/devices/:index", patch(api::patch_device))
        // Scanning
        .route("/scan/:index", post(api::start_scan))
        .route("/scan/:index/progress", get(api::scan_progress))
        .route("/scan/:index/cancel", post(api::cancel_scan))
        .route("/channels", get(api::get_channels))
        // Tuning and streaming
        .route("/tune", post(api::tune))
        .route("/stream/:service_id", get(stream::stream))
        .route("/current", get(stream::current))
        .route("/dls/:service_id", get(stream::dls))
        .route("/slide/:service_id", get(stream::slide))
        // Setup lifecycle
        .route("/setup/status", get(api::setup_status))
        .route("/setup/complete", post(api::setup_complete))
        .route("/setup/reset", post(api::setup_reset))
        // Aggregate health
        .route("/status", get(api::status))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve the API until the process exits.
pub async fn serve(
    listen_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("API listening on http://{}", listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
