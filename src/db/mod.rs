//! Database layer for track-dl
//!
//! Handles SQLite persistence for download records, their per-source rows,
//! multi-track contexts and runtime state.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`records`] — Download record CRUD and stage commits
//! - [`sources`] — Per-source progress rows of the Download group
//! - [`contexts`] — Album/playlist contexts and their completion
//! - [`state`] — Runtime state (shutdown tracking)

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;
use utoipa::ToSchema;

use crate::error::StageError;
use crate::types::{Event, StageKind, Status, TrackData, TrackId};

mod contexts;
mod migrations;
mod records;
mod sources;
mod state;

/// New download record to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Track identity
    pub track_id: TrackId,
    /// Owning extension
    pub extension_id: String,
    /// Album or playlist the track was requested from
    pub context_id: Option<String>,
    /// Metadata already known to the caller
    pub track_data: Option<TrackData>,
    /// Position within the batch
    pub sort_order: i64,
}

/// A downloaded-but-unmerged source part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PartialFile {
    /// Source index the part belongs to
    pub source_index: usize,
    /// Path of the part on disk
    pub path: PathBuf,
}

/// Durable per-track state; the single source of truth for resumption
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DownloadRecord {
    /// Track identity
    pub track_id: TrackId,
    /// Owning extension
    pub extension_id: String,
    /// Album or playlist the track was requested from
    pub context_id: Option<String>,
    /// Opaque provider metadata
    pub track_data: Option<TrackData>,
    /// Whether `track_data` holds fully loaded metadata
    pub metadata_loaded: bool,
    /// Chosen stream, once selected
    pub selected_stream_id: Option<String>,
    /// Source parts to fetch; empty until Load computes them
    pub source_indexes: Vec<usize>,
    /// Fetched parts, in source-index order
    pub partial_files: Vec<PartialFile>,
    /// Output of the Merge stage
    pub merged_file: Option<PathBuf>,
    /// Output of the Tag stage
    pub tagged_file: Option<PathBuf>,
    /// Output of the Save stage
    pub final_file: Option<PathBuf>,
    /// Persisted status
    pub status: Status,
    /// Bytes fetched so far
    pub progress_bytes: u64,
    /// Expected total size, when every source reported one
    pub total_bytes: Option<u64>,
    /// Current throughput
    pub speed_bps: Option<u64>,
    /// Bytes handled so far by the running Load, Merge, Tag or Save stage
    pub stage_bytes: u64,
    /// Failure, present only when `status` is Failed
    pub last_error: Option<StageError>,
    /// Position within the batch
    pub sort_order: i64,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
    /// When the track was saved
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadRecord {
    /// Partial file of `source_index`, if that part has been fetched
    pub fn partial_file(&self, source_index: usize) -> Option<&PathBuf> {
        self.partial_files
            .iter()
            .find(|p| p.source_index == source_index)
            .map(|p| &p.path)
    }
}

/// Download record row (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub(crate) struct RecordRow {
    pub track_id: TrackId,
    pub extension_id: String,
    pub context_id: Option<String>,
    pub track_data: Option<String>,
    pub metadata_loaded: i32,
    pub selected_stream_id: Option<String>,
    pub source_indexes: String,
    pub merged_file: Option<String>,
    pub tagged_file: Option<String>,
    pub final_file: Option<String>,
    pub status: i32,
    pub progress_bytes: i64,
    pub total_bytes: Option<i64>,
    pub speed_bps: Option<i64>,
    pub stage_bytes: i64,
    pub last_error: Option<String>,
    pub sort_order: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Per-source row of the Download group
#[derive(Debug, Clone, FromRow)]
pub struct SourceRow {
    /// Track the source belongs to
    pub track_id: TrackId,
    /// Source index within the selected stream
    pub source_index: i64,
    /// Bytes persisted for this source
    pub downloaded_bytes: i64,
    /// Expected size of this source
    pub total_bytes: Option<i64>,
    /// Current throughput of this source
    pub speed_bps: Option<i64>,
    /// Fetched part, once the source's Download stage completed
    pub file_path: Option<String>,
}

/// Record columns returned after every progress write
#[derive(Debug, Clone, Copy, FromRow)]
pub struct RecordProgress {
    /// Status code
    pub status: i32,
    /// Bytes fetched so far
    pub progress_bytes: i64,
    /// Expected total size
    pub total_bytes: Option<i64>,
    /// Current throughput
    pub speed_bps: Option<i64>,
    /// Bytes of the running non-download stage
    pub stage_bytes: i64,
}

impl RecordProgress {
    /// Record-change event for this persisted state
    pub fn to_event(&self, track_id: &TrackId, stage: StageKind) -> Event {
        Event::RecordUpdated {
            track_id: track_id.clone(),
            stage,
            status: Status::from_i32(self.status),
            progress_bytes: self.progress_bytes.max(0) as u64,
            total_bytes: self.total_bytes.map(|b| b.max(0) as u64),
            speed_bps: self.speed_bps.map(|b| b.max(0) as u64),
            stage_bytes: self.stage_bytes.max(0) as u64,
        }
    }
}

/// Output written by a completed stage; each variant is one atomic update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// One source part was fetched
    Partial {
        /// Source index
        source_index: usize,
        /// Fetched file
        path: PathBuf,
        /// Size of the fetched file
        size: u64,
    },
    /// All parts were merged
    Merged(PathBuf),
    /// The merged file was tagged
    Tagged(PathBuf),
    /// The tagged file was saved; completes the record
    Saved(PathBuf),
}

/// New context to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewContext {
    /// Context identity
    pub context_id: String,
    /// Owning extension
    pub extension_id: String,
    /// Opaque context metadata
    pub context_data: Option<serde_json::Value>,
}

/// A track joining a context through [`Database::admit_context`]
#[derive(Debug, Clone)]
pub enum ContextMember {
    /// Track without a record yet; inserted as Queued
    New(NewRecord),
    /// Unsaved record moved into the context; Paused or Failed ones are requeued
    Existing {
        /// Track identity
        track_id: TrackId,
        /// Position within the context
        sort_order: i64,
    },
}

impl ContextMember {
    /// Track identity of the member
    pub fn track_id(&self) -> &TrackId {
        match self {
            ContextMember::New(record) => &record.track_id,
            ContextMember::Existing { track_id, .. } => track_id,
        }
    }
}

/// Context record from database
#[derive(Debug, Clone, FromRow)]
pub struct ContextRow {
    /// Context identity
    pub context_id: String,
    /// Owning extension
    pub extension_id: String,
    /// Opaque context metadata as JSON
    pub context_data: Option<String>,
    /// Unix timestamp when the context was requested
    pub created_at: i64,
    /// Unix timestamp when every track of the context was saved
    pub completed_at: Option<i64>,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl RecordRow {
    /// Combine the row with its source rows into a domain record
    pub(crate) fn into_record(self, sources: &[SourceRow]) -> DownloadRecord {
        let track_data = self.track_data.as_deref().and_then(|json| {
            serde_json::from_str::<TrackData>(json)
                .map_err(|e| {
                    tracing::warn!(track_id = %self.track_id, error = %e, "unreadable track_data");
                })
                .ok()
        });
        let source_indexes: Vec<usize> =
            serde_json::from_str(&self.source_indexes).unwrap_or_default();
        let last_error = self.last_error.as_deref().and_then(|json| {
            serde_json::from_str::<StageError>(json)
                .map_err(|e| {
                    tracing::warn!(track_id = %self.track_id, error = %e, "unreadable last_error");
                })
                .ok()
        });

        let mut partial_files: Vec<PartialFile> = sources
            .iter()
            .filter(|s| s.track_id == self.track_id)
            .filter_map(|s| {
                s.file_path.as_ref().map(|path| PartialFile {
                    source_index: s.source_index.max(0) as usize,
                    path: PathBuf::from(path),
                })
            })
            .collect();
        partial_files.sort_by_key(|p| p.source_index);

        DownloadRecord {
            track_id: self.track_id,
            extension_id: self.extension_id,
            context_id: self.context_id,
            track_data,
            metadata_loaded: self.metadata_loaded != 0,
            selected_stream_id: self.selected_stream_id,
            source_indexes,
            partial_files,
            merged_file: self.merged_file.map(PathBuf::from),
            tagged_file: self.tagged_file.map(PathBuf::from),
            final_file: self.final_file.map(PathBuf::from),
            status: Status::from_i32(self.status),
            progress_bytes: self.progress_bytes.max(0) as u64,
            total_bytes: self.total_bytes.map(|b| b.max(0) as u64),
            speed_bps: self.speed_bps.map(|b| b.max(0) as u64),
            stage_bytes: self.stage_bytes.max(0) as u64,
            last_error,
            sort_order: self.sort_order,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
            completed_at: self.completed_at.map(timestamp),
        }
    }
}

/// Database handle for track-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
