//! Track control operations (pause, resume, cancel, retry).

use super::TrackDownloader;
use crate::error::{Error, Result};
use crate::types::{Status, TrackId};

impl TrackDownloader {
    /// Pause a track
    ///
    /// Every live stage of the track stops its current attempt and reports
    /// `Paused`; stages that start later begin paused. Pausing a track that
    /// has no job only marks its record, so resumption scans leave it alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown track and
    /// [`Error::InvalidState`] for a completed or failed one.
    pub async fn pause(&self, track_id: &TrackId) -> Result<()> {
        let record = self.get(track_id).await?;
        if record.status.is_final() {
            return Err(invalid_state(track_id, "pause", record.status));
        }

        if !self.scheduler.pause(track_id) && record.status != Status::Paused {
            self.db.apply_status(track_id, Status::Paused).await?;
            tracing::info!(track_id = %track_id, "paused track without a live job");
        }
        Ok(())
    }

    /// Resume a paused track
    ///
    /// A track with a live job continues with fresh attempts of its paused
    /// stages. A paused record without a job (for example after a restart) is
    /// scheduled again from Load, which skips every completed sub-step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown track and
    /// [`Error::InvalidState`] for a completed or failed one.
    pub async fn resume(&self, track_id: &TrackId) -> Result<()> {
        let record = self.get(track_id).await?;
        if record.status.is_final() {
            return Err(invalid_state(track_id, "resume", record.status));
        }
        if self.scheduler.resume(track_id) {
            return Ok(());
        }

        self.ensure_accepting()?;
        if record.status == Status::Paused {
            self.db.requeue_record(track_id).await?;
        }
        self.enqueue_from_load(track_id, &record.extension_id, record.context_id)
    }

    /// Cancel a track and delete its record
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when there was neither a job nor a record.
    pub async fn cancel(&self, track_id: &TrackId) -> Result<()> {
        if self.scheduler.remove(track_id).await? {
            Ok(())
        } else {
            Err(Error::NotFound(track_id.to_string()))
        }
    }

    /// Cancel every unfinished track and delete its record
    ///
    /// Completed records are kept. Returns the number of tracks removed.
    pub async fn cancel_all(&self) -> Result<usize> {
        let mut removed = self.scheduler.remove_all().await?;
        for record in self.db.list_records().await? {
            if record.status != Status::Completed && self.scheduler.remove(&record.track_id).await? {
                removed += 1;
            }
        }
        tracing::info!(removed, "cancelled all tracks");
        Ok(removed)
    }

    /// Retry a failed track
    ///
    /// Clears the error, moves the record back to Queued and schedules it from
    /// Load. Outputs committed before the failure are kept, so the retry only
    /// repeats the work that did not finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown track and
    /// [`Error::InvalidState`] unless the track failed.
    pub async fn retry(&self, track_id: &TrackId) -> Result<()> {
        self.ensure_accepting()?;
        let record = self.get(track_id).await?;
        if record.status != Status::Failed {
            return Err(invalid_state(track_id, "retry", record.status));
        }

        self.db.requeue_record(track_id).await?;
        tracing::info!(track_id = %track_id, "retrying failed track");
        self.enqueue_from_load(track_id, &record.extension_id, record.context_id)
    }
}

fn invalid_state(track_id: &TrackId, operation: &str, status: Status) -> Error {
    Error::InvalidState {
        track_id: track_id.clone(),
        operation: operation.to_string(),
        current_state: status.to_string(),
    }
}
