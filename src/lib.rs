//! # track-dl
//!
//! Resumable, stage-based download pipeline for music tracks.
//!
//! Every requested track runs through `Load → Download(per source) → Merge →
//! Tag → Save`. Each stage reports a strictly ordered progress stream, every
//! value is persisted before it is published, and each completed stage commits
//! its output to a SQLite record. A restarted pipeline rebuilds each track's
//! remaining plan from that record and skips the work already done.
//!
//! ## Design Philosophy
//!
//! track-dl is designed to be:
//! - **Provider-agnostic** - Metadata, stream selection, fetching, merging,
//!   tagging and saving are delegated to a [`DownloadProvider`]
//! - **Resumable** - The persisted record is the single source of truth
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events and to a combined
//!   progress feed, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use track_dl::{Config, ProviderRegistry, TrackDownloader, TrackId, TrackRequest};
//! # use track_dl::DownloadProvider;
//! # fn my_provider() -> Arc<dyn DownloadProvider> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let providers = ProviderRegistry::new().with("my-extension", my_provider());
//!     let downloader = TrackDownloader::new(Config::default(), providers).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     downloader
//!         .download(TrackRequest {
//!             track_id: TrackId::new("track-1"),
//!             extension_id: "my-extension".to_string(),
//!             track_data: None,
//!             sort_order: 0,
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Pipeline facade (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Stage progress model and its state machine
pub mod progress;
/// Download provider capabilities and registry
pub mod provider;
/// Retry logic with exponential backoff
pub mod retry;
/// Persist-then-publish driver of a single stage
pub mod runner;
/// Per-track jobs, concurrency limits and resumption
pub mod scheduler;
/// Stage workers and their execution driver
pub mod stages;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, DownloadRecord};
pub use downloader::{ContextSubmission, TrackDownloader};
pub use error::{
    ApiError, DatabaseError, Error, ErrorDetail, ProviderError, Result, StageError,
    StageErrorKind, ToHttpStatus,
};
pub use progress::{Final, Progress, ProgressSink};
pub use provider::{DownloadProvider, ProviderRegistry, StreamInfo, TrackContext};
pub use runner::StageOutcome;
pub use scheduler::ResumeReport;
pub use types::{
    ContextRequest, Event, StageKey, StageKind, Status, TrackData, TrackId, TrackRequest,
};
