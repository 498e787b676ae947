//! Core types for track-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utoipa::ToSchema;

use crate::error::StageError;

/// Stable identity of a requested track, as assigned by its provider
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    /// Create a new TrackId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier reduced to characters that are safe in a directory name
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TrackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for TrackId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TrackId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TrackId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Persisted status of a download record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Requested, no stage has started yet
    Queued,
    /// A stage has been initialized
    Initialized,
    /// A stage is making progress
    Progressing,
    /// Paused by the user
    Paused,
    /// Saved to its final location
    Completed,
    /// Cancelled (records in this state are deleted right away)
    Cancelled,
    /// Failed with a structured error
    Failed,
}

impl Status {
    /// Convert integer status code to Status enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => Status::Queued,
            1 => Status::Initialized,
            2 => Status::Progressing,
            3 => Status::Paused,
            4 => Status::Completed,
            5 => Status::Cancelled,
            6 => Status::Failed,
            _ => Status::Failed, // Default to Failed for unknown status
        }
    }

    /// Convert Status enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            Status::Queued => 0,
            Status::Initialized => 1,
            Status::Progressing => 2,
            Status::Paused => 3,
            Status::Completed => 4,
            Status::Cancelled => 5,
            Status::Failed => 6,
        }
    }

    /// Lowercase name, as serialized
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Initialized => "initialized",
            Status::Progressing => "progressing",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
        }
    }

    /// Whether no further stage will run for a record in this status
    pub fn is_final(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Metadata, stream and source selection
    Load,
    /// Fetch of one source part
    Download,
    /// Merge of all source parts
    Merge,
    /// Metadata tagging
    Tag,
    /// Move to the final location and library registration
    Save,
}

impl StageKind {
    /// Lowercase name used in logs and identifiers
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Load => "load",
            StageKind::Download => "download",
            StageKind::Merge => "merge",
            StageKind::Tag => "tag",
            StageKind::Save => "save",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one running stage, used as the key of the combined progress feed
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct StageKey {
    /// Track the stage belongs to
    pub track_id: TrackId,
    /// Stage kind
    pub stage: StageKind,
    /// Source index for download stages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_index: Option<usize>,
}

impl StageKey {
    /// Key for a stage that is not tied to a source index
    pub fn new(track_id: TrackId, stage: StageKind) -> Self {
        Self {
            track_id,
            stage,
            source_index: None,
        }
    }

    /// Key for the download stage of one source index
    pub fn download(track_id: TrackId, source_index: usize) -> Self {
        Self {
            track_id,
            stage: StageKind::Download,
            source_index: Some(source_index),
        }
    }
}

impl std::fmt::Display for StageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source_index {
            Some(index) => write!(f, "{}:{}#{}", self.track_id, self.stage, index),
            None => write!(f, "{}:{}", self.track_id, self.stage),
        }
    }
}

/// Opaque, versioned track metadata owned by the provider
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TrackData {
    /// Provider-defined payload schema version
    pub version: u32,
    /// Provider-defined payload
    pub payload: serde_json::Value,
}

/// A request to download one track
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TrackRequest {
    /// Track identity
    pub track_id: TrackId,
    /// Provider that owns the track
    pub extension_id: String,
    /// Track metadata already known to the caller (skips metadata loading if present)
    #[serde(default)]
    pub track_data: Option<TrackData>,
    /// Position within the batch
    #[serde(default)]
    pub sort_order: i64,
}

/// A request to download every track of an album or playlist
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ContextRequest {
    /// Context identity
    pub context_id: String,
    /// Provider that owns the context
    pub extension_id: String,
    /// Context metadata handed back to the provider on completion
    #[serde(default)]
    pub context_data: Option<serde_json::Value>,
    /// Tracks in caller order
    pub tracks: Vec<TrackRequest>,
}

/// Event emitted during the download lifecycle
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Track record created and queued
    Queued {
        /// Track ID
        track_id: TrackId,
        /// Context the track was requested from
        #[serde(skip_serializing_if = "Option::is_none")]
        context_id: Option<String>,
    },

    /// Record persisted after a progress value
    RecordUpdated {
        /// Track ID
        track_id: TrackId,
        /// Stage that produced the update
        stage: StageKind,
        /// Persisted status
        status: Status,
        /// Persisted progress in bytes
        progress_bytes: u64,
        /// Persisted total size, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
        /// Persisted speed, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        speed_bps: Option<u64>,
        /// Persisted bytes of a Load, Merge, Tag or Save stage
        #[serde(default)]
        stage_bytes: u64,
    },

    /// A stage committed its output
    StageCompleted {
        /// Track ID
        track_id: TrackId,
        /// Stage kind
        stage: StageKind,
        /// Source index for download stages
        #[serde(skip_serializing_if = "Option::is_none")]
        source_index: Option<usize>,
    },

    /// Track saved to its final location
    Completed {
        /// Track ID
        track_id: TrackId,
        /// Final path
        path: PathBuf,
    },

    /// A stage failed; the record holds the same error
    Failed {
        /// Track ID
        track_id: TrackId,
        /// Structured failure
        error: StageError,
    },

    /// Record deleted (cancelled or removed)
    Removed {
        /// Track ID
        track_id: TrackId,
    },

    /// Every track of a context has been saved
    ContextCompleted {
        /// Context ID
        context_id: String,
    },

    /// Pipeline is shutting down
    Shutdown,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_i32() {
        for status in [
            Status::Queued,
            Status::Initialized,
            Status::Progressing,
            Status::Paused,
            Status::Completed,
            Status::Cancelled,
            Status::Failed,
        ] {
            assert_eq!(Status::from_i32(status.to_i32()), status);
        }
    }

    #[test]
    fn unknown_status_code_decodes_as_failed() {
        assert_eq!(Status::from_i32(42), Status::Failed);
    }

    #[test]
    fn only_terminal_statuses_are_final() {
        assert!(Status::Completed.is_final());
        assert!(Status::Cancelled.is_final());
        assert!(Status::Failed.is_final());
        assert!(!Status::Queued.is_final());
        assert!(!Status::Paused.is_final());
        assert!(!Status::Progressing.is_final());
    }

    #[test]
    fn stage_key_display_includes_source_index() {
        let key = StageKey::download(TrackId::from("t1"), 3);
        assert_eq!(key.to_string(), "t1:download#3");
        let key = StageKey::new(TrackId::from("t1"), StageKind::Merge);
        assert_eq!(key.to_string(), "t1:merge");
    }

    #[test]
    fn file_stem_replaces_path_separators() {
        let id = TrackId::from("spotify:track/../x y");
        assert_eq!(id.file_stem(), "spotify_track_.._x_y");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::Removed {
            track_id: TrackId::from("abc"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "removed");
        assert_eq!(json["track_id"], "abc");
    }
}
