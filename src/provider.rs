//! Download provider capability and registry
//!
//! The pipeline never fetches, merges or tags bytes itself. Those steps are
//! delegated to a [`DownloadProvider`] registered under the extension id that
//! owns the track. The provider is resolved once, when the track is enqueued,
//! and every stage of that track talks to the same instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::DownloadConfig;
use crate::db::DownloadRecord;
use crate::error::ProviderError;
use crate::progress::ProgressSink;
use crate::types::{TrackData, TrackId};

/// A stream (rendition) offered by a provider for one track
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Provider-defined stream identifier
    pub id: String,
    /// Human-readable description (codec, bitrate)
    #[serde(default)]
    pub description: Option<String>,
}

/// Everything a provider needs to know about the track it is working on
#[derive(Clone, Debug)]
pub struct TrackContext {
    /// Track identity
    pub track_id: TrackId,
    /// Owning extension
    pub extension_id: String,
    /// Album or playlist the track was requested from
    pub context_id: Option<String>,
    /// Metadata, once loaded
    pub track_data: Option<TrackData>,
    /// Selected stream, once chosen
    pub stream_id: Option<String>,
    /// Position within the batch
    pub sort_order: i64,
    /// Per-track scratch directory for partial, merged and tagged files
    pub work_dir: PathBuf,
    /// Directory the track is saved into
    pub destination_dir: PathBuf,
}

impl TrackContext {
    /// Build the context for a persisted record
    pub fn from_record(record: &DownloadRecord, config: &DownloadConfig) -> Self {
        Self {
            track_id: record.track_id.clone(),
            extension_id: record.extension_id.clone(),
            context_id: record.context_id.clone(),
            track_data: record.track_data.clone(),
            stream_id: record.selected_stream_id.clone(),
            sort_order: record.sort_order,
            work_dir: config.temp_dir.join(record.track_id.file_stem()),
            destination_dir: config.download_dir.clone(),
        }
    }
}

/// Capability interface implemented by every download provider
///
/// Calls that produce files receive a [`ProgressSink`] to report byte counts.
/// A call may be dropped at any await point when its stage is cancelled or
/// paused, so providers must leave files in a state a later call can resume
/// or overwrite.
#[async_trait]
pub trait DownloadProvider: Send + Sync {
    /// Provider name, for logs
    fn name(&self) -> &str;

    /// How many tracks may run their Download group at the same time
    fn concurrent_downloads(&self) -> usize {
        1
    }

    /// Fetch full track metadata
    async fn load_track(&self, ctx: &TrackContext) -> Result<TrackData, ProviderError>;

    /// Choose a stream for the track, or `None` when the track has none
    async fn select_stream(&self, ctx: &TrackContext) -> Result<Option<StreamInfo>, ProviderError>;

    /// Source part indexes of `stream_id` that must be fetched
    async fn select_sources(
        &self,
        ctx: &TrackContext,
        stream_id: &str,
    ) -> Result<Vec<usize>, ProviderError>;

    /// Fetch one source part into the work directory and return its path
    ///
    /// `resume_from` is the number of bytes already persisted for this part.
    /// When the data on disk is shorter, the provider continues from what it
    /// has and reports the real offset through `sink`.
    async fn download(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        source_index: usize,
        resume_from: u64,
    ) -> Result<PathBuf, ProviderError>;

    /// Merge source parts, given in source-index order, into one file
    async fn merge(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        files: &[PathBuf],
    ) -> Result<PathBuf, ProviderError>;

    /// Write metadata tags into `file` and return the tagged file
    async fn tag(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        file: &Path,
    ) -> Result<PathBuf, ProviderError>;

    /// Move `file` to its final location and register it with the library
    ///
    /// Must be idempotent: running it again after a crash must not create a
    /// second library entry.
    async fn save(&self, ctx: &TrackContext, file: &Path) -> Result<PathBuf, ProviderError>;

    /// Ask the library to pick up a newly tagged file
    async fn rescan_library(&self, _ctx: &TrackContext, _file: &Path) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Every track of `context_id` has been saved; `files` are in batch order
    async fn context_completed(
        &self,
        _context_id: &str,
        _files: &[PathBuf],
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// A registered provider together with its Download-group semaphore
#[derive(Clone)]
pub struct ProviderHandle {
    /// Extension id the provider is registered under
    pub extension_id: String,
    /// Provider implementation
    pub provider: Arc<dyn DownloadProvider>,
    /// Limits concurrent Download groups to `concurrent_downloads()`
    pub download_permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("extension_id", &self.extension_id)
            .field("provider", &self.provider.name())
            .field("available_permits", &self.download_permits.available_permits())
            .finish()
    }
}

/// Providers keyed by extension id
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderHandle>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `extension_id`, replacing any previous one
    pub fn register(
        &mut self,
        extension_id: impl Into<String>,
        provider: Arc<dyn DownloadProvider>,
    ) -> &mut Self {
        let extension_id = extension_id.into();
        let permits = provider.concurrent_downloads().max(1);
        tracing::debug!(
            extension_id = %extension_id,
            provider = provider.name(),
            concurrent_downloads = permits,
            "registered download provider"
        );
        self.providers.insert(
            extension_id.clone(),
            ProviderHandle {
                extension_id,
                provider,
                download_permits: Arc::new(Semaphore::new(permits)),
            },
        );
        self
    }

    /// Builder-style [`ProviderRegistry::register`]
    pub fn with(mut self, extension_id: impl Into<String>, provider: Arc<dyn DownloadProvider>) -> Self {
        self.register(extension_id, provider);
        self
    }

    /// Look up the provider for `extension_id`
    pub fn resolve(&self, extension_id: &str) -> crate::Result<ProviderHandle> {
        self.providers
            .get(extension_id)
            .cloned()
            .ok_or_else(|| crate::Error::ProviderNotFound(extension_id.to_string()))
    }

    /// Registered extension ids
    pub fn extension_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
