//! Track and context requests.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use utoipa::ToSchema;

use super::TrackDownloader;
use crate::db::{ContextMember, NewContext, NewRecord};
use crate::error::{Error, Result};
use crate::stages::complete_context_if_done;
use crate::stages::plan::load_only;
use crate::types::{ContextRequest, Event, Status, TrackId, TrackRequest};

/// Result of a context request
#[derive(Clone, Debug, Default, Serialize, ToSchema)]
pub struct ContextSubmission {
    /// Context identity
    pub context_id: String,
    /// Tracks that were queued
    pub queued: Vec<TrackId>,
    /// Tracks that were already queued, already completed, or repeated
    pub skipped: Vec<TrackId>,
}

impl TrackDownloader {
    /// Request one track
    ///
    /// Creates the record (or reuses a Failed or Paused one) and schedules the
    /// track from its Load stage.
    ///
    /// # Errors
    ///
    /// - [`Error::ProviderNotFound`] when no provider owns `extension_id`
    /// - [`Error::AlreadyQueued`] when the track already has a live job
    /// - [`Error::InvalidState`] when the track was already saved
    /// - [`Error::ShuttingDown`] during shutdown
    pub async fn download(&self, request: TrackRequest) -> Result<TrackId> {
        self.ensure_accepting()?;
        self.providers.resolve(&request.extension_id)?;
        self.submit(request).await
    }

    /// Request every track of an album or playlist
    ///
    /// Tracks are queued in the order given; that order also decides the
    /// order of files handed to the provider when the context completes.
    /// Tracks that are already queued, already saved, or repeated within the
    /// request are skipped. An unsaved record from an earlier request joins
    /// the context at its new position.
    ///
    /// The context and all of its records are written before any track is
    /// scheduled, so an early Save never sees a partial context.
    pub async fn download_context(&self, request: ContextRequest) -> Result<ContextSubmission> {
        self.ensure_accepting()?;
        let handle = self.providers.resolve(&request.extension_id)?;

        let mut submission = ContextSubmission {
            context_id: request.context_id.clone(),
            ..Default::default()
        };
        if request.tracks.is_empty() {
            return Ok(submission);
        }

        let mut members = Vec::with_capacity(request.tracks.len());
        let mut extension_ids = HashMap::new();
        let mut seen = HashSet::new();
        for (position, track) in request.tracks.into_iter().enumerate() {
            let track_id = track.track_id;
            if !seen.insert(track_id.clone()) {
                submission.skipped.push(track_id);
                continue;
            }
            let sort_order = position as i64;
            match self.db.get_record(&track_id).await? {
                None => {
                    extension_ids.insert(track_id.clone(), request.extension_id.clone());
                    members.push(ContextMember::New(NewRecord {
                        track_id,
                        extension_id: request.extension_id.clone(),
                        context_id: Some(request.context_id.clone()),
                        track_data: track.track_data,
                        sort_order,
                    }));
                }
                Some(existing)
                    if existing.status == Status::Completed
                        || self.scheduler.is_tracked(&track_id) =>
                {
                    submission.skipped.push(track_id);
                }
                Some(existing) => {
                    extension_ids.insert(track_id.clone(), existing.extension_id);
                    members.push(ContextMember::Existing {
                        track_id,
                        sort_order,
                    });
                }
            }
        }

        let admitted: HashSet<TrackId> = self
            .db
            .admit_context(
                &NewContext {
                    context_id: request.context_id.clone(),
                    extension_id: request.extension_id.clone(),
                    context_data: request.context_data.clone(),
                },
                &members,
            )
            .await?
            .into_iter()
            .collect();

        for member in members {
            let track_id = member.track_id().clone();
            // Saved or deleted between the lookup and the transaction
            if !admitted.contains(&track_id) {
                submission.skipped.push(track_id);
                continue;
            }
            let extension_id = extension_ids
                .remove(&track_id)
                .unwrap_or_else(|| request.extension_id.clone());
            match self.enqueue_from_load(&track_id, &extension_id, Some(request.context_id.clone()))
            {
                Ok(()) => submission.queued.push(track_id),
                Err(Error::AlreadyQueued(_)) => submission.skipped.push(track_id),
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            context_id = %submission.context_id,
            queued = submission.queued.len(),
            skipped = submission.skipped.len(),
            "context requested"
        );

        // Nothing left to run, so no Save stage will complete the context
        if submission.queued.is_empty() {
            complete_context_if_done(
                &self.db,
                handle.provider.as_ref(),
                &self.event_tx,
                &submission.context_id,
            )
            .await?;
        }

        Ok(submission)
    }

    /// Create or reuse the record and schedule it from Load
    async fn submit(&self, request: TrackRequest) -> Result<TrackId> {
        let track_id = request.track_id.clone();
        let extension_id = match self.db.get_record(&track_id).await? {
            None => {
                self.db
                    .insert_record(&NewRecord {
                        track_id: track_id.clone(),
                        extension_id: request.extension_id.clone(),
                        context_id: None,
                        track_data: request.track_data,
                        sort_order: request.sort_order,
                    })
                    .await?;
                request.extension_id
            }
            Some(existing) => {
                if existing.status == Status::Completed {
                    return Err(Error::InvalidState {
                        track_id,
                        operation: "download".to_string(),
                        current_state: existing.status.to_string(),
                    });
                }
                if self.scheduler.is_tracked(&track_id) {
                    return Err(Error::AlreadyQueued(track_id));
                }
                if matches!(existing.status, Status::Failed | Status::Paused) {
                    self.db.requeue_record(&track_id).await?;
                }
                existing.extension_id
            }
        };

        self.enqueue_from_load(&track_id, &extension_id, None)?;
        Ok(track_id)
    }

    /// Announce and schedule a record from its Load stage
    pub(crate) fn enqueue_from_load(
        &self,
        track_id: &TrackId,
        extension_id: &str,
        context_id: Option<String>,
    ) -> Result<()> {
        self.emit_event(Event::Queued {
            track_id: track_id.clone(),
            context_id,
        });
        self.scheduler
            .enqueue(track_id.clone(), extension_id, load_only())
    }
}
