//! OpenAPI documentation and schema generation
//!
//! Defines the OpenAPI specification of the track-dl REST API using utoipa
//! for compile-time spec generation. Served at `/openapi.json`.

use utoipa::OpenApi;

/// OpenAPI documentation for the track-dl REST API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "track-dl REST API",
        version = "0.1.0",
        description = "REST API for requesting, controlling and observing resumable track downloads",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:6790", description = "Local development server")
    ),
    paths(
        // Downloads
        crate::api::routes::list_downloads,
        crate::api::routes::get_download,
        crate::api::routes::add_download,
        crate::api::routes::cancel_all_downloads,
        crate::api::routes::cancel_download,
        crate::api::routes::pause_download,
        crate::api::routes::resume_download,
        crate::api::routes::retry_download,

        // Contexts
        crate::api::routes::add_context,
        crate::api::routes::get_context,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
        crate::api::routes::progress_stream,
    ),
    components(schemas(
        // Core types from types.rs
        crate::types::TrackId,
        crate::types::Status,
        crate::types::StageKind,
        crate::types::StageKey,
        crate::types::TrackData,
        crate::types::TrackRequest,
        crate::types::ContextRequest,
        crate::types::Event,

        // Records from db
        crate::db::DownloadRecord,
        crate::db::PartialFile,

        // Facade results
        crate::downloader::ContextSubmission,
        crate::scheduler::ResumeReport,

        // API request/response types from routes
        crate::api::routes::CancelAllResponse,
        crate::api::routes::QueuedResponse,

        // Error types from error.rs
        crate::error::StageError,
        crate::error::StageErrorKind,
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "downloads", description = "Track requests - Request, pause, resume, retry and cancel tracks"),
        (name = "contexts", description = "Albums and playlists - Request every track of a context"),
        (name = "system", description = "System endpoints - Health checks, OpenAPI spec, event and progress streams"),
    )
)]
pub struct ApiDoc;
