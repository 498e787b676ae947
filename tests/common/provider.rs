//! Scripted provider that serves deterministic parts from memory

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use track_dl::{
    DownloadProvider, ProgressSink, ProviderError, StreamInfo, TrackContext, TrackData, TrackId,
};

/// One `download` call as observed by the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadCall {
    /// Track the part belongs to
    pub track_id: TrackId,
    /// Source index
    pub source_index: usize,
    /// Offset the pipeline asked to resume from
    pub resume_from: u64,
}

/// Provider whose parts are `part_len` copies of one byte per source
///
/// Bytes are written to the work directory in `chunk` sized steps with
/// `delay` between steps, so tests can pause or cancel mid-part.
pub struct ScriptedProvider {
    pub sources: usize,
    pub part_len: usize,
    pub chunk: usize,
    pub delay: Duration,
    pub concurrency: usize,
    /// Sources that fail until repaired
    pub broken: Mutex<HashSet<(TrackId, usize)>>,
    pub downloads: Mutex<Vec<DownloadCall>>,
    pub loads: Mutex<Vec<TrackId>>,
    /// Files handed to `context_completed`, per call
    pub contexts: Mutex<Vec<(String, Vec<PathBuf>)>>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ScriptedProvider {
    /// Two 64-byte sources, written 8 bytes at a time without delay
    pub fn new() -> Self {
        Self {
            sources: 2,
            part_len: 64,
            chunk: 8,
            delay: Duration::ZERO,
            concurrency: 1,
            broken: Mutex::new(HashSet::new()),
            downloads: Mutex::new(Vec::new()),
            loads: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Same parts, written slowly enough to be interrupted
    pub fn slow() -> Self {
        Self {
            part_len: 1024,
            delay: Duration::from_millis(5),
            ..Self::new()
        }
    }

    pub fn break_source(&self, track_id: &str, source_index: usize) {
        self.broken
            .lock()
            .unwrap()
            .insert((TrackId::new(track_id), source_index));
    }

    pub fn repair_all(&self) {
        self.broken.lock().unwrap().clear();
    }

    pub fn downloads(&self) -> Vec<DownloadCall> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn downloads_of(&self, track_id: &str) -> Vec<DownloadCall> {
        self.downloads()
            .into_iter()
            .filter(|call| call.track_id.as_str() == track_id)
            .collect()
    }

    pub fn load_count(&self, track_id: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == track_id)
            .count()
    }

    pub fn completed_contexts(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Content of a saved track
    pub fn expected_file(&self) -> Vec<u8> {
        let mut content = Vec::new();
        for index in 0..self.sources {
            content.extend(part_byte(index).to_string().repeat(self.part_len).into_bytes());
        }
        content.extend_from_slice(b"#tagged");
        content
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn part_byte(index: usize) -> char {
    char::from(b'A' + (index % 26) as u8)
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DownloadProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn concurrent_downloads(&self) -> usize {
        self.concurrency
    }

    async fn load_track(&self, ctx: &TrackContext) -> Result<TrackData, ProviderError> {
        self.loads.lock().unwrap().push(ctx.track_id.clone());
        Ok(TrackData {
            version: 2,
            payload: serde_json::json!({ "title": format!("Track {}", ctx.track_id) }),
        })
    }

    async fn select_stream(&self, _ctx: &TrackContext) -> Result<Option<StreamInfo>, ProviderError> {
        Ok(Some(StreamInfo {
            id: "flac".to_string(),
            description: Some("FLAC 16/44.1".to_string()),
        }))
    }

    async fn select_sources(
        &self,
        _ctx: &TrackContext,
        _stream_id: &str,
    ) -> Result<Vec<usize>, ProviderError> {
        Ok((0..self.sources).collect())
    }

    async fn download(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        source_index: usize,
        resume_from: u64,
    ) -> Result<PathBuf, ProviderError> {
        self.downloads.lock().unwrap().push(DownloadCall {
            track_id: ctx.track_id.clone(),
            source_index,
            resume_from,
        });
        if self
            .broken
            .lock()
            .unwrap()
            .contains(&(ctx.track_id.clone(), source_index))
        {
            return Err(ProviderError::Other(format!(
                "source {source_index} of {} is unavailable",
                ctx.track_id
            )));
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = Active(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);

        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let path = ctx.work_dir.join(format!("source-{source_index}.part"));
        let mut content = tokio::fs::read(&path).await.unwrap_or_default();
        content.truncate(resume_from.min(self.part_len as u64) as usize);

        let byte = part_byte(source_index) as u8;
        sink.set_total(self.part_len as u64);
        sink.set_downloaded(content.len() as u64);
        while content.len() < self.part_len {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let step = self.chunk.min(self.part_len - content.len());
            content.extend(std::iter::repeat_n(byte, step));
            tokio::fs::write(&path, &content).await?;
            sink.add_downloaded(step as u64);
        }
        tokio::fs::write(&path, &content).await?;
        Ok(path)
    }

    async fn merge(
        &self,
        sink: ProgressSink,
        ctx: &TrackContext,
        files: &[PathBuf],
    ) -> Result<PathBuf, ProviderError> {
        let mut merged = Vec::new();
        for file in files {
            merged.extend(tokio::fs::read(file).await?);
            sink.set_downloaded(merged.len() as u64);
        }
        let path = ctx.work_dir.join("merged.flac");
        tokio::fs::write(&path, &merged).await?;
        Ok(path)
    }

    async fn tag(
        &self,
        _sink: ProgressSink,
        ctx: &TrackContext,
        file: &Path,
    ) -> Result<PathBuf, ProviderError> {
        let mut content = tokio::fs::read(file).await?;
        content.extend_from_slice(b"#tagged");
        let path = ctx.work_dir.join("tagged.flac");
        tokio::fs::write(&path, &content).await?;
        Ok(path)
    }

    async fn save(&self, ctx: &TrackContext, file: &Path) -> Result<PathBuf, ProviderError> {
        tokio::fs::create_dir_all(&ctx.destination_dir).await?;
        let path = ctx
            .destination_dir
            .join(format!("{}.flac", ctx.track_id.file_stem()));
        tokio::fs::copy(file, &path).await?;
        Ok(path)
    }

    async fn context_completed(
        &self,
        context_id: &str,
        files: &[PathBuf],
    ) -> Result<(), ProviderError> {
        self.contexts
            .lock()
            .unwrap()
            .push((context_id.to_string(), files.to_vec()));
        Ok(())
    }
}
