//! Tag stage.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::db::StageOutput;
use crate::error::{StageError, StageErrorKind};
use crate::progress::ProgressSink;
use crate::provider::TrackContext;
use crate::types::{StageKind, TrackId};

use super::{StageEnv, StageWorker, file_exists, fresh_context};

/// Writes metadata tags into the merged file
pub struct TagStage {
    env: StageEnv,
    ctx: TrackContext,
}

impl TagStage {
    /// Create the Tag stage for a track
    pub fn new(env: StageEnv, ctx: TrackContext) -> Self {
        Self { env, ctx }
    }
}

#[async_trait]
impl StageWorker for TagStage {
    type Output = PathBuf;

    fn kind(&self) -> StageKind {
        StageKind::Tag
    }

    fn track_id(&self) -> &TrackId {
        &self.ctx.track_id
    }

    async fn execute(
        &self,
        sink: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<PathBuf, StageError> {
        let (record, ctx) = fresh_context(&self.env, &self.ctx.track_id, StageKind::Tag).await?;

        let merged = match record.merged_file {
            Some(path) if file_exists(&path).await => path,
            _ => {
                return Err(StageError::new(
                    StageErrorKind::MissingParts,
                    StageKind::Tag,
                    ctx.track_id.clone(),
                    "merged file is missing",
                ));
            }
        };

        self.env
            .provider
            .provider
            .tag(sink, &ctx, &merged)
            .await
            .map_err(|e| StageError::from_provider(e, StageKind::Tag, ctx.track_id.clone()))
    }

    fn output_commit(&self, output: &PathBuf) -> Option<StageOutput> {
        Some(StageOutput::Tagged(output.clone()))
    }

    async fn after_commit(&self, output: &PathBuf) {
        if let Err(e) = self
            .env
            .provider
            .provider
            .rescan_library(&self.ctx, output)
            .await
        {
            tracing::warn!(
                track_id = %self.ctx.track_id,
                error = %e,
                "library rescan failed"
            );
        }
    }
}
