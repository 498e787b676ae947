//! Download pipeline facade split into focused submodules.
//!
//! The `TrackDownloader` struct and its methods are organized by domain:
//! - [`requests`] - Track and context requests
//! - [`control`] - Pause, resume, cancel and retry of single tracks
//! - [`lifecycle`] - Resumption scans and shutdown coordination

mod control;
mod lifecycle;
mod requests;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use requests::ContextSubmission;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::db::{Database, DownloadRecord};
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::provider::ProviderRegistry;
use crate::scheduler::Scheduler;
use crate::types::{Event, StageKey, TrackId};

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct TrackDownloader {
    /// Database instance for persistence (wrapped in Arc for sharing across tasks)
    /// Public for integration tests to query record state
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Registered providers, resolved once per enqueue
    pub(crate) providers: Arc<ProviderRegistry>,
    /// Per-track jobs and the combined progress feed
    pub(crate) scheduler: Scheduler,
    /// Flag to indicate whether new requests are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl TrackDownloader {
    /// Create a new TrackDownloader instance
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Opens/creates the SQLite database and runs migrations
    /// - Sets up the event broadcast channel
    /// - Runs the start-up resumption scan, so records left unfinished by a
    ///   previous run continue from their last committed stage output
    pub async fn new(config: Config, providers: ProviderRegistry) -> Result<Self> {
        config.validate()?;

        // Ensure download and temp directories exist
        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;
        tokio::fs::create_dir_all(&config.download.temp_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create temp directory '{}': {}",
                        config.download.temp_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.persistence.database_path).await?;
        if db.was_unclean_shutdown().await? {
            tracing::warn!("previous run did not shut down cleanly, resuming unfinished tracks");
        }
        // Mark that we're starting up (for unclean shutdown detection)
        db.set_clean_start().await?;

        let (event_tx, _rx) = broadcast::channel(config.download.event_buffer.max(1));
        let db = Arc::new(db);
        let config = Arc::new(config);
        let providers = Arc::new(providers);
        let scheduler = Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&providers),
            Arc::clone(&config),
            event_tx.clone(),
        );

        tracing::info!(
            providers = ?providers.extension_ids(),
            database = %config.persistence.database_path.display(),
            "track downloader initialized"
        );

        let downloader = Self {
            db,
            event_tx,
            config,
            providers,
            scheduler,
            accepting_new: Arc::new(AtomicBool::new(true)),
        };

        downloader.scheduler.resume_scan().await?;
        if let Some(interval) = downloader.config.download.resume_scan_interval {
            downloader.scheduler.spawn_resume_scanner(interval);
        }

        Ok(downloader)
    }

    /// Subscribe to record events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events
    /// independently; a subscriber that falls behind by more than
    /// `download.event_buffer` events receives `RecvError::Lagged`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use track_dl::{Config, ProviderRegistry, TrackDownloader};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let downloader = TrackDownloader::new(Config::default(), ProviderRegistry::new()).await?;
    ///
    ///     let mut events = downloader.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             tracing::info!(?event, "download event");
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Latest progress of every running stage, as `(StageKey, Progress)` pairs
    pub fn progress_stream(&self) -> ReceiverStream<(StageKey, Progress<()>)> {
        self.scheduler.progress_stream()
    }

    /// Stages currently publishing progress
    pub fn running_stages(&self) -> Vec<StageKey> {
        self.scheduler.running_stages()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Extension ids with a registered provider
    pub fn extension_ids(&self) -> Vec<String> {
        self.providers.extension_ids()
    }

    /// Fetch one record
    pub async fn get(&self, track_id: &TrackId) -> Result<DownloadRecord> {
        self.db
            .get_record(track_id)
            .await?
            .ok_or_else(|| Error::NotFound(track_id.to_string()))
    }

    /// Every record, oldest first
    pub async fn list(&self) -> Result<Vec<DownloadRecord>> {
        self.db.list_records().await
    }

    /// Records of one context, in batch order
    pub async fn list_context(&self, context_id: &str) -> Result<Vec<DownloadRecord>> {
        self.db.list_context_records(context_id).await
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Spawn the REST API server in a background task
    ///
    /// The server listens on `server.api.bind_address` (default: 127.0.0.1:6790).
    pub fn spawn_api_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let downloader = Arc::new(self.clone());
        let config = Arc::clone(&self.config);

        tokio::spawn(async move { crate::api::start_api_server(downloader, config).await })
    }
}
