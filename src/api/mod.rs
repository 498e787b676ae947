//! REST API server module
//!
//! Exposes the download pipeline over HTTP: requests, per-track control,
//! record queries, and Server-Sent Events for record events and the combined
//! progress feed.

use crate::{Config, Result, TrackDownloader};
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Downloads
/// - `GET /downloads` - List every record
/// - `POST /downloads` - Request one track
/// - `DELETE /downloads` - Cancel every unfinished track
/// - `GET /downloads/:track_id` - Get one record
/// - `DELETE /downloads/:track_id` - Cancel a track and delete its record
/// - `POST /downloads/:track_id/pause` - Pause a track
/// - `POST /downloads/:track_id/resume` - Resume a track
/// - `POST /downloads/:track_id/retry` - Retry a failed track
///
/// ## Contexts
/// - `POST /contexts` - Request every track of an album or playlist
/// - `GET /contexts/:context_id` - Records of one context
///
/// ## System
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /events` - Server-sent record events
/// - `GET /progress` - Server-sent combined progress of running stages
pub fn create_router(downloader: Arc<TrackDownloader>, config: Arc<Config>) -> Router {
    let state = AppState::new(downloader, config.clone());

    let router = Router::new()
        .route(
            "/downloads",
            get(routes::list_downloads)
                .post(routes::add_download)
                .delete(routes::cancel_all_downloads),
        )
        .route(
            "/downloads/:track_id",
            get(routes::get_download).delete(routes::cancel_download),
        )
        .route("/downloads/:track_id/pause", post(routes::pause_download))
        .route("/downloads/:track_id/resume", post(routes::resume_download))
        .route("/downloads/:track_id/retry", post(routes::retry_download))
        .route("/contexts", post(routes::add_context))
        .route("/contexts/:context_id", get(routes::get_context))
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        .route("/events", get(routes::event_stream))
        .route("/progress", get(routes::progress_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.server.api.cors_enabled {
        let cors = build_cors_layer(&config.server.api.cors_origins);
        router.layer(cors)
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// `"*"` (or an empty list) allows any origin; otherwise only the listed
/// origins that parse as header values are allowed.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address.
///
/// Runs until the listener fails or the task is aborted.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use track_dl::{Config, ProviderRegistry, TrackDownloader};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(Config::default());
/// let downloader = TrackDownloader::new((*config).clone(), ProviderRegistry::new()).await?;
///
/// // Start API server (blocks until shutdown)
/// track_dl::api::start_api_server(Arc::new(downloader), config).await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server(downloader: Arc<TrackDownloader>, config: Arc<Config>) -> Result<()> {
    let bind_address = config.server.api.bind_address;
    tracing::info!(address = %bind_address, "Starting API server");

    let app = create_router(downloader, config);
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(address = %bind_address, "API server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
