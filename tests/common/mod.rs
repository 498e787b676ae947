//! Common test utilities for track-dl pipeline tests

#[allow(dead_code)]
pub mod assertions;
#[allow(dead_code)]
pub mod provider;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use provider::*;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use track_dl::{Config, ProviderRegistry, TrackDownloader, TrackId, TrackRequest};

/// Extension id the scripted provider is registered under
pub const EXTENSION: &str = "scripted";

/// Config with every directory inside `root` and no provider retries
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = root.join("pipeline.db");
    config.download.download_dir = root.join("library");
    config.download.temp_dir = root.join("work");
    config.retry.max_attempts = 0;
    config.retry.initial_delay = Duration::from_millis(10);
    config
}

/// Start a downloader over `root` with `provider` registered
pub async fn start_downloader(root: &Path, provider: Arc<ScriptedProvider>) -> TrackDownloader {
    let registry = ProviderRegistry::new().with(EXTENSION, provider);
    TrackDownloader::new(test_config(root), registry)
        .await
        .expect("downloader should start")
}

/// Request for one track of the scripted provider
pub fn request(id: &str) -> TrackRequest {
    TrackRequest {
        track_id: TrackId::new(id),
        extension_id: EXTENSION.to_string(),
        track_data: None,
        sort_order: 0,
    }
}
