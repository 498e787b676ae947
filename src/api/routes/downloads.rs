//! Track request and control handlers.

use super::{CancelAllResponse, QueuedResponse};
use crate::api::AppState;
use crate::db::DownloadRecord;
use crate::error::Result;
use crate::types::{TrackId, TrackRequest};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// GET /downloads - List all records
#[utoipa::path(
    get,
    path = "/downloads",
    tag = "downloads",
    responses(
        (status = 200, description = "Every record, oldest first", body = Vec<DownloadRecord>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_downloads(State(state): State<AppState>) -> Result<Json<Vec<DownloadRecord>>> {
    Ok(Json(state.downloader.list().await?))
}

/// GET /downloads/:track_id - Get one record
#[utoipa::path(
    get,
    path = "/downloads/{track_id}",
    tag = "downloads",
    params(
        ("track_id" = String, Path, description = "Track ID")
    ),
    responses(
        (status = 200, description = "Download record", body = DownloadRecord),
        (status = 404, description = "Record not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_download(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<Json<DownloadRecord>> {
    Ok(Json(state.downloader.get(&TrackId::new(track_id)).await?))
}

/// POST /downloads - Request one track
#[utoipa::path(
    post,
    path = "/downloads",
    tag = "downloads",
    request_body = TrackRequest,
    responses(
        (status = 202, description = "Track queued", body = QueuedResponse),
        (status = 409, description = "Track already queued or already saved"),
        (status = 422, description = "No provider for the extension id"),
        (status = 503, description = "Shutting down")
    )
)]
pub async fn add_download(
    State(state): State<AppState>,
    Json(request): Json<TrackRequest>,
) -> Result<impl IntoResponse> {
    let track_id = state.downloader.download(request).await?;
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { track_id })))
}

/// DELETE /downloads - Cancel every unfinished track
#[utoipa::path(
    delete,
    path = "/downloads",
    tag = "downloads",
    responses(
        (status = 200, description = "Tracks cancelled", body = CancelAllResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn cancel_all_downloads(
    State(state): State<AppState>,
) -> Result<Json<CancelAllResponse>> {
    let cancelled = state.downloader.cancel_all().await?;
    Ok(Json(CancelAllResponse { cancelled }))
}

/// DELETE /downloads/:track_id - Cancel a track and delete its record
#[utoipa::path(
    delete,
    path = "/downloads/{track_id}",
    tag = "downloads",
    params(
        ("track_id" = String, Path, description = "Track ID")
    ),
    responses(
        (status = 204, description = "Track cancelled"),
        (status = 404, description = "Record not found")
    )
)]
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.cancel(&TrackId::new(track_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /downloads/:track_id/pause - Pause a track
#[utoipa::path(
    post,
    path = "/downloads/{track_id}/pause",
    tag = "downloads",
    params(
        ("track_id" = String, Path, description = "Track ID")
    ),
    responses(
        (status = 204, description = "Track paused"),
        (status = 404, description = "Record not found"),
        (status = 409, description = "Track already completed or failed")
    )
)]
pub async fn pause_download(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.pause(&TrackId::new(track_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /downloads/:track_id/resume - Resume a paused track
#[utoipa::path(
    post,
    path = "/downloads/{track_id}/resume",
    tag = "downloads",
    params(
        ("track_id" = String, Path, description = "Track ID")
    ),
    responses(
        (status = 204, description = "Track resumed"),
        (status = 404, description = "Record not found"),
        (status = 409, description = "Track already completed or failed")
    )
)]
pub async fn resume_download(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<StatusCode> {
    state.downloader.resume(&TrackId::new(track_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /downloads/:track_id/retry - Retry a failed track
#[utoipa::path(
    post,
    path = "/downloads/{track_id}/retry",
    tag = "downloads",
    params(
        ("track_id" = String, Path, description = "Track ID")
    ),
    responses(
        (status = 202, description = "Track queued again", body = QueuedResponse),
        (status = 404, description = "Record not found"),
        (status = 409, description = "Track has not failed")
    )
)]
pub async fn retry_download(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<impl IntoResponse> {
    let track_id = TrackId::new(track_id);
    state.downloader.retry(&track_id).await?;
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { track_id })))
}
