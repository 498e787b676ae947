//! Download stage: fetch one source part.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::StageOutput;
use crate::error::{StageError, StageErrorKind};
use crate::progress::ProgressSink;
use crate::provider::TrackContext;
use crate::retry::download_with_retry;
use crate::types::{StageKind, TrackId};

use super::{StageEnv, StageWorker};

/// A fetched source part
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedPart {
    /// Part file on disk
    pub path: PathBuf,
    /// Size of the part file
    pub size: u64,
}

/// Fetches one source index through the provider
///
/// Every attempt continues from the bytes persisted for the source, and the
/// provider call is retried with backoff for transient errors.
pub struct DownloadStage {
    env: StageEnv,
    ctx: TrackContext,
    source_index: usize,
}

impl DownloadStage {
    /// Create the Download stage for one source of a track
    pub fn new(env: StageEnv, ctx: TrackContext, source_index: usize) -> Self {
        Self {
            env,
            ctx,
            source_index,
        }
    }

    async fn source(&self) -> Option<crate::db::SourceRow> {
        match self
            .env
            .db
            .get_source(&self.ctx.track_id, self.source_index)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(
                    track_id = %self.ctx.track_id,
                    source_index = self.source_index,
                    error = %e,
                    "failed to read source row"
                );
                None
            }
        }
    }
}

#[async_trait]
impl StageWorker for DownloadStage {
    type Output = DownloadedPart;

    fn kind(&self) -> StageKind {
        StageKind::Download
    }

    fn track_id(&self) -> &TrackId {
        &self.ctx.track_id
    }

    fn source_index(&self) -> Option<usize> {
        Some(self.source_index)
    }

    async fn expected_size(&self) -> Option<u64> {
        self.source()
            .await
            .and_then(|s| s.total_bytes)
            .map(|b| b.max(0) as u64)
    }

    async fn resume_offset(&self) -> u64 {
        self.source()
            .await
            .map(|s| s.downloaded_bytes.max(0) as u64)
            .unwrap_or(0)
    }

    async fn execute(
        &self,
        sink: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<DownloadedPart, StageError> {
        let track_id = &self.ctx.track_id;
        let io_error = |message: &str, e: std::io::Error| {
            StageError::new(StageErrorKind::Io, StageKind::Download, track_id.clone(), message)
                .with_cause(e)
        };

        tokio::fs::create_dir_all(&self.ctx.work_dir)
            .await
            .map_err(|e| io_error("failed to create work directory", e))?;

        let provider = Arc::clone(&self.env.provider.provider);
        let ctx = &self.ctx;
        let source_index = self.source_index;
        let path = download_with_retry(&self.env.config.retry, || {
            let provider = Arc::clone(&provider);
            let sink = sink.clone();
            async move {
                let resume_from = sink.downloaded();
                provider.download(sink, ctx, source_index, resume_from).await
            }
        })
        .await
        .map_err(|e| StageError::from_provider(e, StageKind::Download, track_id.clone()))?;

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error("downloaded part is not readable", e))?
            .len();
        sink.set_downloaded(size);

        Ok(DownloadedPart { path, size })
    }

    fn output_commit(&self, output: &DownloadedPart) -> Option<StageOutput> {
        Some(StageOutput::Partial {
            source_index: self.source_index,
            path: output.path.clone(),
            size: output.size,
        })
    }
}
