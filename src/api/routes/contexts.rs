//! Album and playlist handlers.

use crate::api::AppState;
use crate::db::DownloadRecord;
use crate::error::Result;
use crate::types::ContextRequest;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// POST /contexts - Request every track of an album or playlist
#[utoipa::path(
    post,
    path = "/contexts",
    tag = "contexts",
    request_body = ContextRequest,
    responses(
        (status = 202, description = "Tracks queued", body = ContextSubmission),
        (status = 422, description = "No provider for the extension id"),
        (status = 503, description = "Shutting down")
    )
)]
pub async fn add_context(
    State(state): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> Result<impl IntoResponse> {
    let submission = state.downloader.download_context(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// GET /contexts/:context_id - Records of one context, in batch order
#[utoipa::path(
    get,
    path = "/contexts/{context_id}",
    tag = "contexts",
    params(
        ("context_id" = String, Path, description = "Context ID")
    ),
    responses(
        (status = 200, description = "Records of the context", body = Vec<DownloadRecord>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> Result<Json<Vec<DownloadRecord>>> {
    Ok(Json(state.downloader.list_context(&context_id).await?))
}
