//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`downloads`] — Track requests and per-track control
//! - [`contexts`] — Album and playlist requests
//! - [`system`] — Health, OpenAPI, event and progress streams

use serde::{Deserialize, Serialize};

mod contexts;
mod downloads;
mod system;

// Re-export all handlers so `routes::function_name` continues to work
pub use contexts::*;
pub use downloads::*;
pub use system::*;

/// Response for DELETE /downloads
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct CancelAllResponse {
    /// Number of tracks cancelled
    pub cancelled: usize,
}

/// Response for POST /downloads
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct QueuedResponse {
    /// Queued track
    pub track_id: crate::types::TrackId,
}
