//! Album and playlist contexts.

use std::path::PathBuf;

use crate::error::DatabaseError;
use crate::types::{Status, TrackId};
use crate::{Error, Result};

use super::records::insert_record_with;
use super::{ContextMember, ContextRow, Database, NewContext};

const UPSERT_CONTEXT: &str = r#"
    INSERT INTO download_contexts (context_id, extension_id, context_data, created_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(context_id) DO UPDATE SET
        extension_id = excluded.extension_id,
        context_data = COALESCE(excluded.context_data, download_contexts.context_data),
        completed_at = NULL
"#;

impl Database {
    /// Insert a context, or reopen an existing one with the same id
    ///
    /// Re-requesting a context clears its completion so the completion hook
    /// fires again once the new tracks are saved.
    pub async fn insert_context(&self, context: &NewContext) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let context_data = context
            .context_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(UPSERT_CONTEXT)
            .bind(&context.context_id)
            .bind(&context.extension_id)
            .bind(&context_data)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert context: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Open a context and write every one of its records in one transaction
    ///
    /// New members are inserted as Queued. Existing members take the
    /// context's id and their new position; Paused or Failed ones go back to
    /// Queued. Nothing is visible to a concurrent Save until every sibling is
    /// written, so the context cannot complete with part of its tracks.
    ///
    /// Returns the members that were admitted. An existing record that was
    /// saved or deleted in the meantime is left out.
    pub async fn admit_context(
        &self,
        context: &NewContext,
        members: &[ContextMember],
    ) -> Result<Vec<TrackId>> {
        let now = chrono::Utc::now().timestamp();
        let context_data = context
            .context_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.begin().await?;
        sqlx::query(UPSERT_CONTEXT)
            .bind(&context.context_id)
            .bind(&context.extension_id)
            .bind(&context_data)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert context: {}",
                    e
                )))
            })?;

        let mut admitted = Vec::with_capacity(members.len());
        for member in members {
            match member {
                ContextMember::New(record) => {
                    let record = super::NewRecord {
                        context_id: Some(context.context_id.clone()),
                        ..record.clone()
                    };
                    insert_record_with(&mut *tx, &record).await?;
                }
                ContextMember::Existing {
                    track_id,
                    sort_order,
                } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE downloads SET
                            context_id = ?,
                            sort_order = ?,
                            status = CASE WHEN status IN (?, ?) THEN ? ELSE status END,
                            last_error = CASE WHEN status IN (?, ?) THEN NULL ELSE last_error END,
                            speed_bps = CASE WHEN status IN (?, ?) THEN NULL ELSE speed_bps END,
                            updated_at = ?
                        WHERE track_id = ? AND final_file IS NULL
                        "#,
                    )
                    .bind(&context.context_id)
                    .bind(*sort_order)
                    .bind(Status::Paused.to_i32())
                    .bind(Status::Failed.to_i32())
                    .bind(Status::Queued.to_i32())
                    .bind(Status::Paused.to_i32())
                    .bind(Status::Failed.to_i32())
                    .bind(Status::Paused.to_i32())
                    .bind(Status::Failed.to_i32())
                    .bind(now)
                    .bind(track_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::QueryFailed(format!(
                            "Failed to move record into context: {}",
                            e
                        )))
                    })?;
                    if result.rows_affected() == 0 {
                        continue;
                    }
                }
            }
            admitted.push(member.track_id().clone());
        }

        Self::commit(tx).await?;
        Ok(admitted)
    }

    /// Get a context by id
    pub async fn get_context(&self, context_id: &str) -> Result<Option<ContextRow>> {
        sqlx::query_as::<_, ContextRow>(
            r#"
            SELECT context_id, extension_id, context_data, created_at, completed_at
            FROM download_contexts WHERE context_id = ?
            "#,
        )
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get context: {}",
                e
            )))
        })
    }

    /// Count the records of a context that have not been saved yet
    pub async fn count_unsaved_in_context(&self, context_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM downloads WHERE context_id = ? AND final_file IS NULL",
        )
        .bind(context_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count unsaved tracks: {}",
                e
            )))
        })
    }

    /// Mark a context completed
    ///
    /// Returns true only for the call that actually completed it, so the
    /// completion hook runs once even when the last tracks finish together.
    pub async fn mark_context_completed(&self, context_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE download_contexts SET completed_at = ?
            WHERE context_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(now)
        .bind(context_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark context completed: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Final files of a context, in batch order
    pub async fn list_context_final_files(&self, context_id: &str) -> Result<Vec<PathBuf>> {
        let files: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT final_file FROM downloads
            WHERE context_id = ? AND final_file IS NOT NULL
            ORDER BY sort_order ASC, track_id ASC
            "#,
        )
        .bind(context_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list context files: {}",
                e
            )))
        })?;

        Ok(files.into_iter().map(PathBuf::from).collect())
    }

    /// Contexts whose tracks are all saved but which were never marked completed
    ///
    /// Happens when the process stopped between the last Save and the
    /// completion hook.
    pub async fn list_pending_contexts(&self) -> Result<Vec<ContextRow>> {
        sqlx::query_as::<_, ContextRow>(
            r#"
            SELECT c.context_id, c.extension_id, c.context_data, c.created_at, c.completed_at
            FROM download_contexts c
            WHERE c.completed_at IS NULL
              AND EXISTS (SELECT 1 FROM downloads d WHERE d.context_id = c.context_id)
              AND NOT EXISTS (
                  SELECT 1 FROM downloads d
                  WHERE d.context_id = c.context_id AND d.final_file IS NULL
              )
            ORDER BY c.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list pending contexts: {}",
                e
            )))
        })
    }

    /// Delete the completed records of a context, and the context once empty
    ///
    /// Returns the number of records deleted.
    pub async fn prune_context(&self, context_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let deleted = sqlx::query("DELETE FROM downloads WHERE context_id = ? AND status = ?")
            .bind(context_id)
            .bind(Status::Completed.to_i32())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to prune context records: {}",
                    e
                )))
            })?
            .rows_affected();

        sqlx::query(
            r#"
            DELETE FROM download_contexts
            WHERE context_id = ?
              AND NOT EXISTS (SELECT 1 FROM downloads WHERE context_id = ?)
            "#,
        )
        .bind(context_id)
        .bind(context_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to prune context: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit transaction: {}",
                e
            )))
        })?;

        Ok(deleted)
    }
}
