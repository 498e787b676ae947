//! Save stage and context completion.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, StageOutput};
use crate::error::{StageError, StageErrorKind};
use crate::progress::ProgressSink;
use crate::provider::{DownloadProvider, TrackContext};
use crate::types::{Event, StageKind, TrackId};

use super::{StageEnv, StageWorker, file_exists, fresh_context};

/// Moves the tagged file to its final location
///
/// Committing the output completes the record. When the record belongs to a
/// context, the last save of that context also completes the context.
pub struct SaveStage {
    env: StageEnv,
    ctx: TrackContext,
}

impl SaveStage {
    /// Create the Save stage for a track
    pub fn new(env: StageEnv, ctx: TrackContext) -> Self {
        Self { env, ctx }
    }
}

#[async_trait]
impl StageWorker for SaveStage {
    type Output = PathBuf;

    fn kind(&self) -> StageKind {
        StageKind::Save
    }

    fn track_id(&self) -> &TrackId {
        &self.ctx.track_id
    }

    async fn execute(
        &self,
        _sink: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<PathBuf, StageError> {
        let (record, ctx) = fresh_context(&self.env, &self.ctx.track_id, StageKind::Save).await?;

        let tagged = match record.tagged_file {
            Some(path) if file_exists(&path).await => path,
            _ => {
                return Err(StageError::new(
                    StageErrorKind::MissingParts,
                    StageKind::Save,
                    ctx.track_id.clone(),
                    "tagged file is missing",
                ));
            }
        };

        self.env
            .provider
            .provider
            .save(&ctx, &tagged)
            .await
            .map_err(|e| StageError::from_provider(e, StageKind::Save, ctx.track_id.clone()))
    }

    fn output_commit(&self, output: &PathBuf) -> Option<StageOutput> {
        Some(StageOutput::Saved(output.clone()))
    }

    async fn after_commit(&self, _output: &PathBuf) {
        let Some(context_id) = self.ctx.context_id.as_deref() else {
            return;
        };
        if let Err(e) = complete_context_if_done(
            &self.env.db,
            self.env.provider.provider.as_ref(),
            &self.env.events,
            context_id,
        )
        .await
        {
            tracing::warn!(
                track_id = %self.ctx.track_id,
                context_id,
                error = %e,
                "failed to check context completion"
            );
        }
    }
}

/// Complete `context_id` when every one of its records has been saved
///
/// Runs the provider's completion hook and emits `ContextCompleted` only for
/// the call that marks the context, so concurrent saves fire it once.
/// Counts the unsaved siblings on every call, which is quadratic over a large
/// context.
pub(crate) async fn complete_context_if_done(
    db: &Database,
    provider: &dyn DownloadProvider,
    events: &broadcast::Sender<Event>,
    context_id: &str,
) -> crate::Result<bool> {
    if db.count_unsaved_in_context(context_id).await? > 0 {
        return Ok(false);
    }
    if !db.mark_context_completed(context_id).await? {
        return Ok(false);
    }

    let files = db.list_context_final_files(context_id).await?;
    tracing::info!(context_id, tracks = files.len(), "context completed");

    if let Err(e) = provider.context_completed(context_id, &files).await {
        tracing::warn!(context_id, error = %e, "context completion hook failed");
    }

    events
        .send(Event::ContextCompleted {
            context_id: context_id.to_string(),
        })
        .ok();
    Ok(true)
}
