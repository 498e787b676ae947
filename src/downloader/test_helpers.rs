//! Shared test helpers: a file-writing fake provider and downloader builders.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::db::{Database, NewRecord};
use crate::downloader::TrackDownloader;
use crate::error::ProviderError;
use crate::progress::ProgressSink;
use crate::provider::{DownloadProvider, ProviderRegistry, StreamInfo, TrackContext};
use crate::stages::StageEnv;
use crate::types::{TrackData, TrackId};

/// Extension id the fake provider is registered under
pub(crate) const FAKE_EXTENSION: &str = "fake";

/// Bytes written per progress report
const CHUNK: usize = 4;

/// Provider that writes real files into the track's work directory
///
/// Part `i` is `part_size` copies of the byte `b'a' + i`. Merge concatenates
/// parts, tag appends a marker, save copies into the destination directory.
pub(crate) struct FakeProvider {
    pub(crate) sources: Vec<usize>,
    pub(crate) part_size: usize,
    pub(crate) chunk_delay: Duration,
    pub(crate) merge_delay: Duration,
    pub(crate) no_streams: bool,
    pub(crate) concurrency: usize,
    pub(crate) failing_sources: Mutex<HashSet<usize>>,
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) active: AtomicUsize,
    pub(crate) max_active: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            sources: vec![0, 1],
            part_size: 16,
            chunk_delay: Duration::ZERO,
            merge_delay: Duration::ZERO,
            no_streams: false,
            concurrency: 1,
            failing_sources: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl FakeProvider {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn fail_source(&self, index: usize) {
        self.failing_sources.lock().unwrap().insert(index);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Expected content of part `index`
    pub(crate) fn part_bytes(&self, index: usize) -> Vec<u8> {
        vec![b'a' + index as u8; self.part_size]
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DownloadProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn concurrent_downloads(&self) -> usize {
        self.concurrency
    }

    async fn load_track(&self, ctx: &TrackContext) -> Result<TrackData, ProviderError> {
        self.record(format!("load {}", ctx.track_id));
        Ok(TrackData {
            version: 1,
            payload: serde_json::json!({ "title": ctx.track_id.as_str() }),
        })
    }

    async fn select_stream(&self, ctx: &TrackContext) -> Result<Option<StreamInfo>, ProviderError> {
        self.record(format!("stream {}", ctx.track_id));
        if self.no_streams {
            return Ok(None);
        }
        Ok(Some(StreamInfo {
            id: "lossless".to_string(),
            description: None,
        }))
    }

    async fn select_sources(
        &self,
        ctx: &TrackContext,
        _stream_id: &str,
    ) -> Result<Vec<usize>, ProviderError> {
        self.record(format!("sources {}", ctx.track_id));
        Ok(self.sources.clone())
    }

    async fn download(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        source_index: usize,
        resume_from: u64,
    ) -> Result<PathBuf, ProviderError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let path = ctx.work_dir.join(format!("part-{source_index}"));
        let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let start = resume_from.min(on_disk).min(self.part_size as u64) as usize;
        self.record(format!("download {}#{} from {}", ctx.track_id, source_index, start));

        if self.failing_sources.lock().unwrap().contains(&source_index) {
            return Err(ProviderError::Other(format!("source {source_index} unavailable")));
        }

        let bytes = self.part_bytes(source_index);
        let mut content = bytes[..start].to_vec();
        sink.set_total(self.part_size as u64);
        sink.set_downloaded(start as u64);
        for chunk in bytes[start..].chunks(CHUNK) {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            content.extend_from_slice(chunk);
            tokio::fs::write(&path, &content).await?;
            sink.add_downloaded(chunk.len() as u64);
        }
        if start == self.part_size {
            tokio::fs::write(&path, &content).await?;
        }
        Ok(path)
    }

    async fn merge(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        files: &[PathBuf],
    ) -> Result<PathBuf, ProviderError> {
        self.record(format!("merge {}", ctx.track_id));
        let mut merged = Vec::new();
        for file in files {
            merged.extend(tokio::fs::read(file).await?);
            sink.set_downloaded(merged.len() as u64);
            if !self.merge_delay.is_zero() {
                tokio::time::sleep(self.merge_delay).await;
            }
        }
        let path = ctx.work_dir.join("merged");
        tokio::fs::write(&path, &merged).await?;
        Ok(path)
    }

    async fn tag(
        &self,
        _sink: ProgressSink,
        ctx: &TrackContext,
        file: &Path,
    ) -> Result<PathBuf, ProviderError> {
        self.record(format!("tag {}", ctx.track_id));
        let mut content = tokio::fs::read(file).await?;
        content.extend_from_slice(b"[tagged]");
        let path = ctx.work_dir.join("tagged");
        tokio::fs::write(&path, &content).await?;
        Ok(path)
    }

    async fn save(&self, ctx: &TrackContext, file: &Path) -> Result<PathBuf, ProviderError> {
        self.record(format!("save {}", ctx.track_id));
        tokio::fs::create_dir_all(&ctx.destination_dir).await?;
        let path = ctx
            .destination_dir
            .join(format!("{}.bin", ctx.track_id.file_stem()));
        tokio::fs::copy(file, &path).await?;
        Ok(path)
    }

    async fn context_completed(
        &self,
        context_id: &str,
        files: &[PathBuf],
    ) -> Result<(), ProviderError> {
        self.record(format!("context {} {}", context_id, files.len()));
        Ok(())
    }
}

/// Config with every directory inside `root`
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = root.join("test.db");
    config.download.download_dir = root.join("downloads");
    config.download.temp_dir = root.join("temp");
    config.retry.max_attempts = 0;
    config.retry.initial_delay = Duration::from_millis(10);
    config
}

/// Helper to create a test TrackDownloader around `provider`.
/// Returns the downloader and the tempdir (which must be kept alive).
pub(crate) async fn create_test_downloader_with(
    provider: Arc<FakeProvider>,
) -> (TrackDownloader, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let registry = ProviderRegistry::new().with(FAKE_EXTENSION, provider);
    let downloader = TrackDownloader::new(config, registry).await.unwrap();
    (downloader, temp_dir)
}

/// Helper to create a test TrackDownloader with a default fake provider.
pub(crate) async fn create_test_downloader() -> (TrackDownloader, tempfile::TempDir) {
    create_test_downloader_with(Arc::new(FakeProvider::default())).await
}

/// Wait until `check` holds, polling every 10ms for up to 5 seconds
pub(crate) async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Stage environment backed by a fresh database in a tempdir
pub(crate) async fn stage_env(provider: Arc<FakeProvider>) -> (StageEnv, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::new(&config.persistence.database_path)
        .await
        .unwrap();
    let registry = ProviderRegistry::new().with(FAKE_EXTENSION, provider);
    let (events, _) = broadcast::channel(100);
    let env = StageEnv {
        db: Arc::new(db),
        provider: registry.resolve(FAKE_EXTENSION).unwrap(),
        config: Arc::new(config),
        events,
    };
    (env, dir)
}

/// Insert a record and return its provider context
pub(crate) async fn insert_track(
    env: &StageEnv,
    id: &str,
    context_id: Option<&str>,
) -> TrackContext {
    env.db
        .insert_record(&NewRecord {
            track_id: TrackId::from(id),
            extension_id: FAKE_EXTENSION.to_string(),
            context_id: context_id.map(str::to_string),
            track_data: None,
            sort_order: 0,
        })
        .await
        .unwrap();
    let record = env.db.get_record(&TrackId::from(id)).await.unwrap().unwrap();
    TrackContext::from_record(&record, &env.config.download)
}
