//! Load stage: metadata, stream selection and source selection.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::db::{DownloadRecord, StageOutput};
use crate::error::{ProviderError, StageError};
use crate::progress::ProgressSink;
use crate::types::{StageKind, TrackId};

use super::plan::{QueueItem, plan_remaining};
use super::{StageEnv, StageWorker, file_exists, fresh_context, persistence_error};

/// Loads whatever the record is still missing before bytes can be fetched
///
/// Each sub-step is persisted before the next one starts, so a restart skips
/// the steps that already happened. The output is the list of stage groups
/// the track still needs.
pub struct LoadStage {
    env: StageEnv,
    track_id: TrackId,
}

impl LoadStage {
    /// Create the Load stage for a track
    pub fn new(env: StageEnv, track_id: TrackId) -> Self {
        Self { env, track_id }
    }

    fn provider_error(&self, error: ProviderError) -> StageError {
        StageError::from_provider(error, StageKind::Load, self.track_id.clone())
    }
}

#[async_trait]
impl StageWorker for LoadStage {
    type Output = Vec<QueueItem>;

    fn kind(&self) -> StageKind {
        StageKind::Load
    }

    fn track_id(&self) -> &TrackId {
        &self.track_id
    }

    async fn execute(
        &self,
        _sink: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<Vec<QueueItem>, StageError> {
        let id = &self.track_id;
        let db = &self.env.db;
        let provider = &self.env.provider.provider;
        let persist = |e: crate::Error| persistence_error(StageKind::Load, id, &e);

        let (record, mut ctx) = fresh_context(&self.env, id, StageKind::Load).await?;

        if !record.metadata_loaded {
            let data = provider
                .load_track(&ctx)
                .await
                .map_err(|e| self.provider_error(e))?;
            db.set_track_data(id, &data).await.map_err(persist)?;
            tracing::debug!(track_id = %id, version = data.version, "track metadata loaded");
            ctx.track_data = Some(data);
        }

        let stream_id = match record.selected_stream_id {
            Some(stream_id) => stream_id,
            None => {
                let stream = provider
                    .select_stream(&ctx)
                    .await
                    .map_err(|e| self.provider_error(e))?
                    .ok_or_else(|| self.provider_error(ProviderError::NoStreams))?;
                db.set_selected_stream(id, &stream.id)
                    .await
                    .map_err(persist)?;
                tracing::debug!(track_id = %id, stream_id = %stream.id, "stream selected");
                stream.id
            }
        };
        ctx.stream_id = Some(stream_id.clone());

        if record.source_indexes.is_empty() {
            let mut indexes = provider
                .select_sources(&ctx, &stream_id)
                .await
                .map_err(|e| self.provider_error(e))?;
            indexes.sort_unstable();
            indexes.dedup();
            if indexes.is_empty() {
                return Err(self.provider_error(ProviderError::NoSources));
            }
            db.set_source_indexes(id, &indexes)
                .await
                .map_err(persist)?;
            tracing::debug!(track_id = %id, sources = indexes.len(), "sources selected");
        }

        let (record, _) = fresh_context(&self.env, id, StageKind::Load).await?;
        let on_disk = files_on_disk(&record).await;
        Ok(plan_remaining(&record, |path| on_disk.contains(path)))
    }

    fn output_commit(&self, _output: &Vec<QueueItem>) -> Option<StageOutput> {
        None
    }
}

/// Committed stage outputs of `record` that are still present
async fn files_on_disk(record: &DownloadRecord) -> HashSet<PathBuf> {
    let committed = record
        .tagged_file
        .iter()
        .chain(&record.merged_file)
        .chain(record.partial_files.iter().map(|part| &part.path));

    let mut on_disk = HashSet::new();
    for path in committed {
        if file_exists(path).await {
            on_disk.insert(path.clone());
        }
    }
    on_disk
}
