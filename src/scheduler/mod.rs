//! Track scheduler: runs each track's stage groups in order
//!
//! Every enqueued track gets a [`TaskItem`] and one job task. The job walks the
//! track's queue of stage groups: stages within a group run concurrently, each
//! through a [`TaskRunner`], and a group only starts once the previous one
//! finished. Load's output groups are appended to the queue. A failed or
//! cancelled stage ends the chain; other tracks are unaffected.
//!
//! Load groups share `download.max_concurrent_loads` permits and Download
//! groups share the permits of their provider, so a job may wait before a
//! group starts.

mod fan_in;
mod resume;

pub use fan_in::{ProgressFeed, ProgressHub};
pub use resume::ResumeReport;

use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::provider::{ProviderRegistry, TrackContext};
use crate::runner::{StageOutcome, TaskRunner};
use crate::stages::plan::{QueueItem, StagePlan};
use crate::stages::{
    DownloadStage, LoadStage, MergeStage, PauseSwitch, SaveStage, StageEnv, StageRun, StageWorker,
    TagStage,
};
use crate::types::{Event, StageKey, StageKind, Status, TrackId};

/// Live state of one scheduled track
struct TaskItem {
    job_id: u64,
    cancel: CancellationToken,
    pause: PauseSwitch,
    job: Option<JoinHandle<()>>,
}

type TaskMap = Arc<Mutex<HashMap<TrackId, TaskItem>>>;

/// Runs stage groups for every scheduled track
#[derive(Clone)]
pub struct Scheduler {
    tasks: TaskMap,
    next_job_id: Arc<AtomicU64>,
    load_permits: Arc<Semaphore>,
    providers: Arc<ProviderRegistry>,
    db: Arc<Database>,
    config: Arc<Config>,
    events: broadcast::Sender<Event>,
    hub: Arc<ProgressHub>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    /// Create a scheduler over `db` and the registered providers
    pub fn new(
        db: Arc<Database>,
        providers: Arc<ProviderRegistry>,
        config: Arc<Config>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        let load_permits = Arc::new(Semaphore::new(config.download.max_concurrent_loads.max(1)));
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_job_id: Arc::new(AtomicU64::new(1)),
            load_permits,
            providers,
            db,
            config,
            events,
            hub: Arc::new(ProgressHub::new()),
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Schedule `groups` for a track owned by `extension_id`
    ///
    /// Fails with [`Error::ProviderNotFound`] for an unknown extension and
    /// [`Error::AlreadyQueued`] when the track already has a job.
    pub fn enqueue(
        &self,
        track_id: TrackId,
        extension_id: &str,
        groups: Vec<QueueItem>,
    ) -> Result<()> {
        let provider = self.providers.resolve(extension_id)?;

        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&track_id) {
            return Err(Error::AlreadyQueued(track_id));
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let pause = PauseSwitch::default();
        let job = TrackJob {
            job_id,
            track_id: track_id.clone(),
            cancel: cancel.clone(),
            pause: pause.clone(),
            env: StageEnv {
                db: Arc::clone(&self.db),
                provider,
                config: Arc::clone(&self.config),
                events: self.events.clone(),
            },
            load_permits: Arc::clone(&self.load_permits),
            hub: Arc::clone(&self.hub),
            tasks: Arc::clone(&self.tasks),
        };

        tracing::info!(
            track_id = %track_id,
            extension_id,
            groups = groups.len(),
            "track enqueued"
        );
        // The job removes its own item, so it must not finish before the insert
        let handle = tokio::spawn(job.run(groups));
        tasks.insert(
            track_id,
            TaskItem {
                job_id,
                cancel,
                pause,
                job: Some(handle),
            },
        );
        Ok(())
    }

    /// Whether the track has a live job
    pub fn is_tracked(&self, track_id: &TrackId) -> bool {
        lock(&self.tasks).contains_key(track_id)
    }

    /// Tracks with a live job
    pub fn tracked(&self) -> Vec<TrackId> {
        lock(&self.tasks).keys().cloned().collect()
    }

    /// Pause every live and future stage of the track
    ///
    /// Returns `false` when the track has no job.
    pub fn pause(&self, track_id: &TrackId) -> bool {
        match lock(&self.tasks).get(track_id) {
            Some(item) => {
                item.pause.pause();
                tracing::info!(track_id = %track_id, "track paused");
                true
            }
            None => false,
        }
    }

    /// Resume a paused track
    ///
    /// Returns `false` when the track has no job.
    pub fn resume(&self, track_id: &TrackId) -> bool {
        match lock(&self.tasks).get(track_id) {
            Some(item) => {
                item.pause.resume();
                tracing::info!(track_id = %track_id, "track resumed");
                true
            }
            None => false,
        }
    }

    /// Cancel the track's job, wait for it and delete the record
    ///
    /// Returns `true` when there was a job or a record to remove.
    pub async fn remove(&self, track_id: &TrackId) -> Result<bool> {
        let item = lock(&self.tasks).remove(track_id);
        let tracked = item.is_some();
        if let Some(mut item) = item {
            item.cancel.cancel();
            if let Some(job) = item.job.take()
                && let Err(e) = job.await
            {
                tracing::warn!(track_id = %track_id, error = %e, "track job ended abnormally");
            }
        }

        let deleted = self.db.delete_record(track_id).await?;
        if deleted {
            self.events
                .send(Event::Removed {
                    track_id: track_id.clone(),
                })
                .ok();
        }
        if tracked || deleted {
            tracing::info!(track_id = %track_id, "track removed");
        }
        Ok(tracked || deleted)
    }

    /// [`Scheduler::remove`] for every tracked track
    pub async fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        for track_id in self.tracked() {
            if self.remove(&track_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stop every job and background task without touching records
    ///
    /// Records stay non-final and are picked up by the next resumption scan.
    pub async fn shutdown(&self) {
        let background: Vec<JoinHandle<()>> = lock(&self.background).drain(..).collect();
        for task in background {
            task.abort();
        }

        let items: Vec<(TrackId, TaskItem)> = lock(&self.tasks).drain().collect();
        tracing::info!(jobs = items.len(), "stopping track jobs");
        for (track_id, mut item) in items {
            let Some(job) = item.job.take() else {
                continue;
            };
            job.abort();
            if let Err(e) = job.await
                && !e.is_cancelled()
            {
                tracing::warn!(track_id = %track_id, error = %e, "track job ended abnormally");
            }
        }
    }

    /// Latest progress of every running stage, as `(StageKey, Progress)` pairs
    pub fn progress_stream(&self) -> ReceiverStream<(StageKey, Progress<()>)> {
        self.hub.subscribe()
    }

    /// Stages currently publishing progress
    pub fn running_stages(&self) -> Vec<StageKey> {
        self.hub.running()
    }

    pub(crate) fn track_background(&self, task: JoinHandle<()>) {
        lock(&self.background).push(task);
    }
}

/// Everything one track's job needs
struct TrackJob {
    job_id: u64,
    track_id: TrackId,
    cancel: CancellationToken,
    pause: PauseSwitch,
    env: StageEnv,
    load_permits: Arc<Semaphore>,
    hub: Arc<ProgressHub>,
    tasks: TaskMap,
}

/// Outcome of one stage within a group
enum StageResult {
    Completed(Vec<QueueItem>),
    Cancelled,
    Failed,
}

impl TrackJob {
    async fn run(self, groups: Vec<QueueItem>) {
        let mut queue: VecDeque<QueueItem> = groups.into();
        let mut finished = true;

        while let Some(group) = queue.pop_front() {
            if group.is_empty() {
                continue;
            }
            let Some(_permit) = self.acquire(&group).await else {
                finished = false;
                break;
            };

            let ctx = match self.env.db.get_record(&self.track_id).await {
                Ok(Some(record)) => TrackContext::from_record(&record, &self.env.config.download),
                Ok(None) => {
                    tracing::info!(track_id = %self.track_id, "record deleted, stopping job");
                    finished = false;
                    break;
                }
                Err(e) => {
                    tracing::error!(track_id = %self.track_id, error = %e, "failed to read record");
                    finished = false;
                    break;
                }
            };

            let results = join_all(group.iter().map(|plan| self.run_stage(&ctx, plan))).await;

            let mut proceed = true;
            for result in results {
                match result {
                    StageResult::Completed(more) => queue.extend(more),
                    StageResult::Cancelled | StageResult::Failed => proceed = false,
                }
            }
            if !proceed {
                finished = false;
                break;
            }
        }

        if finished && self.env.config.persistence.prune_completed {
            self.prune().await;
        }

        let mut tasks = lock(&self.tasks);
        if tasks
            .get(&self.track_id)
            .is_some_and(|item| item.job_id == self.job_id)
        {
            tasks.remove(&self.track_id);
        }
    }

    /// Wait for the group's permit; `None` when the track is cancelled first
    async fn acquire(&self, group: &[StagePlan]) -> Option<Option<OwnedSemaphorePermit>> {
        let semaphore = match group.first().map(StagePlan::kind) {
            Some(StageKind::Load) => Arc::clone(&self.load_permits),
            Some(StageKind::Download) => Arc::clone(&self.env.provider.download_permits),
            _ => return Some(None),
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => Some(Some(permit)),
                Err(_) => None,
            },
        }
    }

    async fn run_stage(&self, ctx: &TrackContext, plan: &StagePlan) -> StageResult {
        let env = self.env.clone();
        let outcome = match *plan {
            StagePlan::Load => self
                .run_worker(LoadStage::new(env, ctx.track_id.clone()))
                .await
                .map(|o| o.map(Some)),
            StagePlan::Download { source_index } => self
                .run_worker(DownloadStage::new(env, ctx.clone(), source_index))
                .await
                .map(|o| o.map(|_| None)),
            StagePlan::Merge => self
                .run_worker(MergeStage::new(env, ctx.clone()))
                .await
                .map(|o| o.map(|_| None)),
            StagePlan::Tag => self
                .run_worker(TagStage::new(env, ctx.clone()))
                .await
                .map(|o| o.map(|_| None)),
            StagePlan::Save => self
                .run_worker(SaveStage::new(env, ctx.clone()))
                .await
                .map(|o| o.map(|_| None)),
        };

        match outcome {
            Ok(StageOutcome::Completed(more)) => StageResult::Completed(more.unwrap_or_default()),
            Ok(StageOutcome::Cancelled) => StageResult::Cancelled,
            Err(_) => StageResult::Failed,
        }
    }

    async fn run_worker<W: StageWorker>(
        &self,
        worker: W,
    ) -> std::result::Result<StageOutcome<W::Output>, crate::error::StageError> {
        let run = StageRun::new(worker, &self.cancel).with_pause_switch(self.pause.clone());
        TaskRunner::new(run, Arc::clone(&self.env.db), self.env.events.clone())
            .with_hub(Arc::clone(&self.hub))
            .run()
            .await
    }

    /// Drop a completed record, or its whole context once the context is done
    async fn prune(&self) {
        let db = &self.env.db;
        let record = match db.get_record(&self.track_id).await {
            Ok(Some(record)) if record.status == Status::Completed => record,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(track_id = %self.track_id, error = %e, "failed to read record for pruning");
                return;
            }
        };

        let pruned = match &record.context_id {
            None => db.delete_record(&self.track_id).await.map(u64::from),
            Some(context_id) => match db.get_context(context_id).await {
                Ok(Some(context)) if context.completed_at.is_some() => {
                    db.prune_context(context_id).await
                }
                Ok(_) => Ok(0),
                Err(e) => Err(e),
            },
        };
        match pruned {
            Ok(0) => {}
            Ok(count) => {
                tracing::debug!(track_id = %self.track_id, records = count, "pruned completed records")
            }
            Err(e) => {
                tracing::warn!(track_id = %self.track_id, error = %e, "failed to prune completed records")
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
