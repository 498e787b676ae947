//! Merge stage.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::db::StageOutput;
use crate::error::{StageError, StageErrorKind};
use crate::progress::ProgressSink;
use crate::provider::TrackContext;
use crate::types::{StageKind, TrackId};

use super::{StageEnv, StageWorker, file_exists, fresh_context};

/// Merges every fetched part, in source-index order, into one file
pub struct MergeStage {
    env: StageEnv,
    ctx: TrackContext,
}

impl MergeStage {
    /// Create the Merge stage for a track
    pub fn new(env: StageEnv, ctx: TrackContext) -> Self {
        Self { env, ctx }
    }

    fn missing(&self, message: String) -> StageError {
        StageError::new(
            StageErrorKind::MissingParts,
            StageKind::Merge,
            self.ctx.track_id.clone(),
            message,
        )
    }
}

#[async_trait]
impl StageWorker for MergeStage {
    type Output = PathBuf;

    fn kind(&self) -> StageKind {
        StageKind::Merge
    }

    fn track_id(&self) -> &TrackId {
        &self.ctx.track_id
    }

    async fn expected_size(&self) -> Option<u64> {
        self.env
            .db
            .get_record(&self.ctx.track_id)
            .await
            .ok()
            .flatten()
            .and_then(|r| r.total_bytes)
    }

    async fn execute(
        &self,
        sink: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<PathBuf, StageError> {
        let (record, ctx) = fresh_context(&self.env, &self.ctx.track_id, StageKind::Merge).await?;

        if record.source_indexes.is_empty() {
            return Err(self.missing("no sources selected".to_string()));
        }

        let mut files = Vec::with_capacity(record.source_indexes.len());
        for &index in &record.source_indexes {
            match record.partial_file(index) {
                Some(path) if file_exists(path).await => files.push(path.clone()),
                Some(path) => {
                    return Err(self.missing(format!(
                        "partial file of source {} is gone: {}",
                        index,
                        path.display()
                    )));
                }
                None => {
                    return Err(self.missing(format!("source {} was never downloaded", index)));
                }
            }
        }

        self.env
            .provider
            .provider
            .merge(sink, &ctx, &files)
            .await
            .map_err(|e| StageError::from_provider(e, StageKind::Merge, ctx.track_id.clone()))
    }

    fn output_commit(&self, output: &PathBuf) -> Option<StageOutput> {
        Some(StageOutput::Merged(output.clone()))
    }
}
