//! Download record CRUD and stage output commits.

use sqlx::Sqlite;
use std::collections::HashMap;

use crate::error::{DatabaseError, StageError};
use crate::types::{Status, TrackData, TrackId};
use crate::{Error, Result};

use super::{Database, DownloadRecord, NewRecord, RecordProgress, RecordRow, SourceRow, StageOutput};

const RECORD_COLUMNS: &str = r#"
    track_id, extension_id, context_id, track_data, metadata_loaded,
    selected_stream_id, source_indexes, merged_file, tagged_file, final_file,
    status, progress_bytes, total_bytes, speed_bps, stage_bytes, last_error, sort_order,
    created_at, updated_at, completed_at
"#;

pub(super) const PROGRESS_RETURNING: &str =
    "RETURNING status, progress_bytes, total_bytes, speed_bps, stage_bytes";

impl Database {
    /// Insert a new download record with status Queued
    pub async fn insert_record(&self, record: &NewRecord) -> Result<()> {
        insert_record_with(&self.pool, record).await
    }

    /// Get a record by track id
    pub async fn get_record(&self, track_id: &TrackId) -> Result<Option<DownloadRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM downloads WHERE track_id = ?");
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get record: {}",
                    e
                )))
            })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sources = self.list_sources(track_id).await?;
        Ok(Some(row.into_record(&sources)))
    }

    /// List every record, oldest first
    pub async fn list_records(&self) -> Result<Vec<DownloadRecord>> {
        self.query_records("", None).await
    }

    /// List records that still have stages to run (not Completed, Cancelled or Failed)
    pub async fn list_unfinished_records(&self) -> Result<Vec<DownloadRecord>> {
        let filter = format!(
            "WHERE status NOT IN ({}, {}, {})",
            Status::Completed.to_i32(),
            Status::Cancelled.to_i32(),
            Status::Failed.to_i32()
        );
        self.query_records(&filter, None).await
    }

    /// List the records of one context in batch order
    pub async fn list_context_records(&self, context_id: &str) -> Result<Vec<DownloadRecord>> {
        self.query_records("WHERE context_id = ?", Some(context_id))
            .await
    }

    async fn query_records(
        &self,
        filter: &str,
        context_id: Option<&str>,
    ) -> Result<Vec<DownloadRecord>> {
        let order = if context_id.is_some() {
            "ORDER BY sort_order ASC, track_id ASC"
        } else {
            "ORDER BY created_at ASC, sort_order ASC, track_id ASC"
        };
        let sql = format!("SELECT {RECORD_COLUMNS} FROM downloads {filter} {order}");
        let mut query = sqlx::query_as::<_, RecordRow>(&sql);
        if let Some(context_id) = context_id {
            query = query.bind(context_id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list records: {}",
                e
            )))
        })?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources: HashMap<TrackId, Vec<SourceRow>> = HashMap::new();
        for source in self.list_all_sources().await? {
            sources
                .entry(source.track_id.clone())
                .or_default()
                .push(source);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let own = sources.remove(&row.track_id).unwrap_or_default();
                row.into_record(&own)
            })
            .collect())
    }

    /// Delete a record and its source rows
    ///
    /// Returns whether a record was deleted, so repeated calls are harmless.
    pub async fn delete_record(&self, track_id: &TrackId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM downloads WHERE track_id = ?")
            .bind(track_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete record: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Store loaded metadata and mark it loaded
    pub async fn set_track_data(&self, track_id: &TrackId, data: &TrackData) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.update_field(
            track_id,
            "track_data = ?, metadata_loaded = 1",
            &json,
            "track data",
        )
        .await
    }

    /// Store the selected stream
    pub async fn set_selected_stream(&self, track_id: &TrackId, stream_id: &str) -> Result<()> {
        self.update_field(
            track_id,
            "selected_stream_id = ?",
            stream_id,
            "selected stream",
        )
        .await
    }

    async fn update_field(
        &self,
        track_id: &TrackId,
        assignment: &str,
        value: &str,
        what: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!("UPDATE downloads SET {assignment}, updated_at = ? WHERE track_id = ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(now)
            .bind(track_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set {}: {}",
                    what, e
                )))
            })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "record {}",
                track_id
            ))));
        }
        Ok(())
    }

    /// Mark the record's current stage as Initialized
    ///
    /// Only a Queued record moves to Initialized; a record that already ran a
    /// stage keeps its status.
    pub async fn apply_initialized(&self, track_id: &TrackId) -> Result<Option<RecordProgress>> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE downloads
            SET status = CASE WHEN status = ? THEN ? ELSE status END,
                stage_bytes = 0,
                updated_at = ?
            WHERE track_id = ?
            {PROGRESS_RETURNING}
            "#
        );
        sqlx::query_as::<_, RecordProgress>(&sql)
            .bind(Status::Queued.to_i32())
            .bind(Status::Initialized.to_i32())
            .bind(now)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to apply initialized state: {}",
                    e
                )))
            })
    }

    /// Record the bytes and speed of a Load, Merge, Tag or Save stage
    ///
    /// `progress_bytes` keeps the fetched size of the track; the stage's own
    /// counter goes to `stage_bytes`.
    pub async fn apply_stage_progress(
        &self,
        track_id: &TrackId,
        downloaded: u64,
        speed: Option<u64>,
        status: Status,
    ) -> Result<Option<RecordProgress>> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE downloads
            SET status = ?, stage_bytes = ?, speed_bps = ?, last_error = NULL, updated_at = ?
            WHERE track_id = ?
            {PROGRESS_RETURNING}
            "#
        );
        sqlx::query_as::<_, RecordProgress>(&sql)
            .bind(status.to_i32())
            .bind(downloaded as i64)
            .bind(speed.map(|s| s as i64))
            .bind(now)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update stage progress: {}",
                    e
                )))
            })
    }

    /// Set the status of a record without touching its counters
    pub async fn apply_status(
        &self,
        track_id: &TrackId,
        status: Status,
    ) -> Result<Option<RecordProgress>> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE downloads
            SET status = ?, speed_bps = NULL, last_error = NULL, updated_at = ?
            WHERE track_id = ?
            {PROGRESS_RETURNING}
            "#
        );
        sqlx::query_as::<_, RecordProgress>(&sql)
            .bind(status.to_i32())
            .bind(now)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update status: {}",
                    e
                )))
            })
    }

    /// Write a completed stage's output
    ///
    /// Each output is one atomic update. `Saved` also moves the record to
    /// Completed; every other output leaves it Progressing.
    pub async fn commit_stage_output(
        &self,
        track_id: &TrackId,
        output: &StageOutput,
    ) -> Result<Option<RecordProgress>> {
        let now = chrono::Utc::now().timestamp();
        let (assignment, path, status) = match output {
            StageOutput::Partial {
                source_index,
                path,
                size,
            } => {
                return self
                    .commit_partial(track_id, *source_index, path, *size)
                    .await;
            }
            StageOutput::Merged(path) => ("merged_file = ?", path, Status::Progressing),
            StageOutput::Tagged(path) => ("tagged_file = ?", path, Status::Progressing),
            StageOutput::Saved(path) => (
                "final_file = ?, completed_at = ?",
                path,
                Status::Completed,
            ),
        };

        let sql = format!(
            r#"
            UPDATE downloads
            SET {assignment}, status = ?, speed_bps = NULL, last_error = NULL, updated_at = ?
            WHERE track_id = ?
            {PROGRESS_RETURNING}
            "#
        );
        let mut query =
            sqlx::query_as::<_, RecordProgress>(&sql).bind(path.to_string_lossy().to_string());
        if matches!(output, StageOutput::Saved(_)) {
            query = query.bind(now);
        }
        query
            .bind(status.to_i32())
            .bind(now)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to commit stage output: {}",
                    e
                )))
            })
    }

    /// Mark a record Failed with its structured error
    pub async fn mark_failed(
        &self,
        track_id: &TrackId,
        error: &StageError,
    ) -> Result<Option<RecordProgress>> {
        let now = chrono::Utc::now().timestamp();
        let json = serde_json::to_string(error)?;
        let sql = format!(
            r#"
            UPDATE downloads
            SET status = ?, last_error = ?, speed_bps = NULL, updated_at = ?
            WHERE track_id = ?
            {PROGRESS_RETURNING}
            "#
        );
        sqlx::query_as::<_, RecordProgress>(&sql)
            .bind(Status::Failed.to_i32())
            .bind(json)
            .bind(now)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to mark record failed: {}",
                    e
                )))
            })
    }

    /// Current status and counters of a record, or `None` if it was deleted
    pub async fn record_progress(&self, track_id: &TrackId) -> Result<Option<RecordProgress>> {
        sqlx::query_as::<_, RecordProgress>(
            r#"
            SELECT status, progress_bytes, total_bytes, speed_bps, stage_bytes
            FROM downloads WHERE track_id = ?
            "#,
        )
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get record progress: {}",
                e
            )))
        })
    }

    /// Put a Paused or Failed record back to Queued, clearing its error
    ///
    /// Returns false when the record is missing or in any other status.
    pub async fn requeue_record(&self, track_id: &TrackId) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, last_error = NULL, speed_bps = NULL, updated_at = ?
            WHERE track_id = ? AND status IN (?, ?)
            "#,
        )
        .bind(Status::Queued.to_i32())
        .bind(now)
        .bind(track_id)
        .bind(Status::Paused.to_i32())
        .bind(Status::Failed.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to requeue record: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }
}

/// Insert a Queued record on any executor, so context admission can share it
pub(super) async fn insert_record_with<'e, E>(executor: E, record: &NewRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    let track_data = record
        .track_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO downloads (
            track_id, extension_id, context_id, track_data, metadata_loaded,
            status, sort_order, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.track_id)
    .bind(&record.extension_id)
    .bind(&record.context_id)
    .bind(&track_data)
    .bind(record.track_data.is_some() as i32)
    .bind(Status::Queued.to_i32())
    .bind(record.sort_order)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to insert record: {}",
            e
        )))
    })?;

    Ok(())
}
