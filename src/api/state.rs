//! Application state for the API server

use crate::{Config, TrackDownloader};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (Arc clones only).
#[derive(Clone)]
pub struct AppState {
    /// The downloader that serves every request
    pub downloader: Arc<TrackDownloader>,

    /// Configuration the server was started with
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(downloader: Arc<TrackDownloader>, config: Arc<Config>) -> Self {
        Self { downloader, config }
    }
}
