//! System handlers: health, OpenAPI, record events and progress streams.

use crate::api::AppState;
use crate::progress::Progress;
use crate::types::{Event, StageKey};
use axum::{
    Json,
    extract::State,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// GET /health - Health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is healthy")
    )
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "accepting": state.downloader.is_accepting(),
        "running_stages": state.downloader.running_stages().len(),
        "providers": state.downloader.extension_ids(),
    }))
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/openapi.json",
    tag = "system",
    responses(
        (status = 200, description = "OpenAPI 3.1 specification in JSON format")
    )
)]
pub async fn openapi_spec() -> impl IntoResponse {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;

    Json(ApiDoc::openapi())
}

/// SSE event name of a record event
fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Queued { .. } => "queued",
        Event::RecordUpdated { .. } => "record_updated",
        Event::StageCompleted { .. } => "stage_completed",
        Event::Completed { .. } => "completed",
        Event::Failed { .. } => "failed",
        Event::Removed { .. } => "removed",
        Event::ContextCompleted { .. } => "context_completed",
        Event::Shutdown => "shutdown",
    }
}

/// GET /events - Server-sent record events
#[utoipa::path(
    get,
    path = "/events",
    tag = "system",
    responses(
        (status = 200, description = "Server-sent events stream (text/event-stream)", content_type = "text/event-stream")
    )
)]
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.downloader.subscribe());

    let sse_stream = stream.filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json_data) => Some(Ok(SseEvent::default()
                .event(event_name(&event))
                .data(json_data))),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize event to JSON");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "SSE client lagged");
            Some(Ok(SseEvent::default().event("error").data(format!(
                r#"{{"error":"lagged","skipped":{}}}"#,
                skipped
            ))))
        }
    });

    Sse::new(sse_stream).keep_alive(KeepAlive::default())
}

/// One message of the progress stream
#[derive(Serialize)]
struct ProgressMessage<'a> {
    stage: &'a StageKey,
    progress: &'a Progress<()>,
}

/// GET /progress - Server-sent combined progress of running stages
///
/// Each message carries the stage key and its latest progress value. Slow
/// clients only see the latest value of each stage.
#[utoipa::path(
    get,
    path = "/progress",
    tag = "system",
    responses(
        (status = 200, description = "Server-sent progress stream (text/event-stream)", content_type = "text/event-stream")
    )
)]
pub async fn progress_stream(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = state.downloader.progress_stream();

    let sse_stream = stream.filter_map(|(key, progress)| {
        let message = ProgressMessage {
            stage: &key,
            progress: &progress,
        };
        match serde_json::to_string(&message) {
            Ok(json_data) => Some(Ok(SseEvent::default()
                .event(progress.name())
                .data(json_data))),
            Err(e) => {
                tracing::warn!(stage = %key, error = %e, "Failed to serialize progress to JSON");
                None
            }
        }
    });

    Sse::new(sse_stream).keep_alive(KeepAlive::default())
}
