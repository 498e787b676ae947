//! Per-source progress rows of the Download group.
//!
//! Every write to a source row recomputes the record's aggregate counters in
//! the same transaction, so `downloads.progress_bytes` is always the sum of
//! its sources.

use sqlx::{Sqlite, Transaction};
use std::path::Path;

use crate::error::DatabaseError;
use crate::types::{Status, TrackId};
use crate::{Error, Result};

use super::records::PROGRESS_RETURNING;
use super::{Database, RecordProgress, SourceRow};

const SOURCE_COLUMNS: &str =
    "track_id, source_index, downloaded_bytes, total_bytes, speed_bps, file_path";

impl Database {
    /// List the source rows of a record, in index order
    pub async fn list_sources(&self, track_id: &TrackId) -> Result<Vec<SourceRow>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM download_sources WHERE track_id = ? ORDER BY source_index ASC"
        );
        sqlx::query_as::<_, SourceRow>(&sql)
            .bind(track_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list sources: {}",
                    e
                )))
            })
    }

    pub(super) async fn list_all_sources(&self) -> Result<Vec<SourceRow>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM download_sources ORDER BY track_id ASC, source_index ASC"
        );
        sqlx::query_as::<_, SourceRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list sources: {}",
                    e
                )))
            })
    }

    /// Get one source row
    pub async fn get_source(
        &self,
        track_id: &TrackId,
        source_index: usize,
    ) -> Result<Option<SourceRow>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM download_sources WHERE track_id = ? AND source_index = ?"
        );
        sqlx::query_as::<_, SourceRow>(&sql)
            .bind(track_id)
            .bind(source_index as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get source: {}",
                    e
                )))
            })
    }

    /// Store the selected source indexes and create their rows
    ///
    /// Existing rows keep their progress, so selecting the same sources again
    /// after a restart does not lose fetched bytes.
    pub async fn set_source_indexes(&self, track_id: &TrackId, indexes: &[usize]) -> Result<()> {
        let json = serde_json::to_string(indexes)?;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            "UPDATE downloads SET source_indexes = ?, updated_at = ? WHERE track_id = ?",
        )
        .bind(&json)
        .bind(now)
        .bind(track_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set source indexes: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "record {}",
                track_id
            ))));
        }

        for index in indexes {
            sqlx::query(
                "INSERT OR IGNORE INTO download_sources (track_id, source_index) VALUES (?, ?)",
            )
            .bind(track_id)
            .bind(*index as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert source row: {}",
                    e
                )))
            })?;
        }

        Self::refresh_totals(&mut tx, track_id, None).await?;
        Self::commit(tx).await
    }

    /// Record the expected size of one source and move the record to Initialized
    pub async fn apply_source_initialized(
        &self,
        track_id: &TrackId,
        source_index: usize,
        total: Option<u64>,
    ) -> Result<Option<RecordProgress>> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE download_sources
            SET total_bytes = COALESCE(?, total_bytes)
            WHERE track_id = ? AND source_index = ?
            "#,
        )
        .bind(total.map(|t| t as i64))
        .bind(track_id)
        .bind(source_index as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to initialize source: {}",
                e
            )))
        })?;

        let progress = Self::refresh_totals(&mut tx, track_id, None).await?;
        Self::commit(tx).await?;
        Ok(progress)
    }

    /// Record bytes and speed of one source and set the record's status
    pub async fn apply_source_progress(
        &self,
        track_id: &TrackId,
        source_index: usize,
        downloaded: u64,
        speed: Option<u64>,
        status: Status,
    ) -> Result<Option<RecordProgress>> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE download_sources
            SET downloaded_bytes = ?, speed_bps = ?
            WHERE track_id = ? AND source_index = ?
            "#,
        )
        .bind(downloaded as i64)
        .bind(speed.map(|s| s as i64))
        .bind(track_id)
        .bind(source_index as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update source progress: {}",
                e
            )))
        })?;

        let progress = Self::refresh_totals(&mut tx, track_id, Some(status)).await?;
        Self::commit(tx).await?;
        Ok(progress)
    }

    /// Write a fetched part and its final size
    pub(super) async fn commit_partial(
        &self,
        track_id: &TrackId,
        source_index: usize,
        path: &Path,
        size: u64,
    ) -> Result<Option<RecordProgress>> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE download_sources
            SET file_path = ?, downloaded_bytes = ?, total_bytes = ?, speed_bps = NULL
            WHERE track_id = ? AND source_index = ?
            "#,
        )
        .bind(path.to_string_lossy().to_string())
        .bind(size as i64)
        .bind(size as i64)
        .bind(track_id)
        .bind(source_index as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit partial file: {}",
                e
            )))
        })?;

        let progress = Self::refresh_totals(&mut tx, track_id, Some(Status::Progressing)).await?;
        Self::commit(tx).await?;
        Ok(progress)
    }

    /// Recompute the record's aggregate counters from its source rows
    ///
    /// `status` of `None` moves a Queued record to Initialized and leaves any
    /// other status alone. A Failed record keeps its status and error, so a
    /// sibling download finishing after a failure does not hide it. Returns
    /// `None` when the record no longer exists.
    async fn refresh_totals(
        tx: &mut Transaction<'_, Sqlite>,
        track_id: &TrackId,
        status: Option<Status>,
    ) -> Result<Option<RecordProgress>> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE downloads SET
                progress_bytes = (
                    SELECT COALESCE(SUM(downloaded_bytes), 0)
                    FROM download_sources WHERE track_id = ?
                ),
                total_bytes = (
                    SELECT CASE
                        WHEN COUNT(*) > 0 AND COUNT(*) = COUNT(total_bytes) THEN SUM(total_bytes)
                    END
                    FROM download_sources WHERE track_id = ?
                ),
                speed_bps = (
                    SELECT SUM(speed_bps) FROM download_sources WHERE track_id = ?
                ),
                status = CASE
                    WHEN status = ? THEN status
                    ELSE COALESCE(?, CASE WHEN status = ? THEN ? ELSE status END)
                END,
                last_error = CASE WHEN status = ? THEN last_error END,
                updated_at = ?
            WHERE track_id = ?
            {PROGRESS_RETURNING}
            "#
        );
        sqlx::query_as::<_, RecordProgress>(&sql)
            .bind(track_id)
            .bind(track_id)
            .bind(track_id)
            .bind(Status::Failed.to_i32())
            .bind(status.map(|s| s.to_i32()))
            .bind(Status::Queued.to_i32())
            .bind(Status::Initialized.to_i32())
            .bind(Status::Failed.to_i32())
            .bind(now)
            .bind(track_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to refresh record totals: {}",
                    e
                )))
            })
    }

    pub(super) async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })
    }

    pub(super) async fn commit(tx: Transaction<'static, Sqlite>) -> Result<()> {
        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit transaction: {}",
                e
            )))
        })
    }
}
