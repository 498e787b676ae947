//! Stage workers and the driver that runs them
//!
//! A track moves through five fixed stages: Load, Download (one per source
//! index), Merge, Tag and Save. Each stage is a [`StageWorker`]; a
//! [`StageRun`] drives one worker through the progress state machine:
//!
//! - [`StageRun::initialize`] hands out the progress receiver
//! - [`StageRun::start`] emits `Initialized` and `InProgress`, then runs attempts
//! - [`StageRun::pause`] aborts the running attempt and emits `Paused`
//! - [`StageRun::resume`] starts a fresh attempt of the same stage
//! - [`StageRun::cancel`] aborts the attempt and emits `Final::Cancelled`
//!
//! Workers never talk to observers. Persistence and publishing belong to the
//! [`TaskRunner`](crate::runner::TaskRunner) that consumes the progress stream.

mod download;
mod load;
mod merge;
pub mod plan;
mod save;
mod tag;

pub use download::{DownloadStage, DownloadedPart};
pub use load::LoadStage;
pub use merge::MergeStage;
pub use save::SaveStage;
pub(crate) use save::complete_context_if_done;
pub use tag::TagStage;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{Database, StageOutput};
use crate::error::{StageError, StageErrorKind};
use crate::progress::{Final, Progress, ProgressSink};
use crate::provider::{ProviderHandle, TrackContext};
use crate::types::{Event, StageKey, StageKind, TrackId};

/// Buffered progress values between a stage driver and its consumer
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// Shared services every stage worker needs
#[derive(Clone)]
pub struct StageEnv {
    /// Record store
    pub db: Arc<Database>,
    /// Provider resolved for the track
    pub provider: ProviderHandle,
    /// Downloader configuration
    pub config: Arc<Config>,
    /// Record-change event channel
    pub events: broadcast::Sender<Event>,
}

/// One stage of the pipeline
///
/// `execute` is called once per attempt. A pause or cancel drops the attempt at
/// its next await point, so an attempt must be safe to abandon halfway.
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    /// Result carried by `Final::Completed`
    type Output: Send + Sync + 'static;

    /// Stage kind
    fn kind(&self) -> StageKind;

    /// Track the stage belongs to
    fn track_id(&self) -> &TrackId;

    /// Source index, for Download stages
    fn source_index(&self) -> Option<usize> {
        None
    }

    /// Identity of this stage in the combined progress feed
    fn key(&self) -> StageKey {
        StageKey {
            track_id: self.track_id().clone(),
            stage: self.kind(),
            source_index: self.source_index(),
        }
    }

    /// Expected final size, reported with `Initialized`
    async fn expected_size(&self) -> Option<u64> {
        None
    }

    /// Bytes already persisted, where each attempt starts counting from
    async fn resume_offset(&self) -> u64 {
        0
    }

    /// Run one attempt
    async fn execute(
        &self,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Self::Output, StageError>;

    /// Record mutation for a completed attempt, if the stage writes one
    fn output_commit(&self, output: &Self::Output) -> Option<StageOutput>;

    /// Side effects that must only happen once the output is persisted
    async fn after_commit(&self, _output: &Self::Output) {}
}

/// Pause flag shared by the stages of one track
#[derive(Clone, Debug)]
pub struct PauseSwitch(Arc<watch::Sender<bool>>);

impl Default for PauseSwitch {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PauseSwitch {
    /// Create a switch in the given state
    pub fn new(paused: bool) -> Self {
        Self(Arc::new(watch::Sender::new(paused)))
    }

    /// Ask every stage observing this switch to pause
    pub fn pause(&self) {
        self.0.send_replace(true);
    }

    /// Let paused stages start a fresh attempt
    pub fn resume(&self) {
        self.0.send_replace(false);
    }

    /// Current state
    pub fn is_paused(&self) -> bool {
        *self.0.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Live execution of one stage worker
pub struct StageRun<W: StageWorker> {
    worker: Arc<W>,
    cancel: CancellationToken,
    pause: PauseSwitch,
    tx: Option<mpsc::Sender<Progress<W::Output>>>,
    driver: Option<AbortOnDrop<()>>,
}

impl<W: StageWorker> StageRun<W> {
    /// Create a run whose cancellation is a child of `parent`
    pub fn new(worker: W, parent: &CancellationToken) -> Self {
        Self {
            worker: Arc::new(worker),
            cancel: parent.child_token(),
            pause: PauseSwitch::default(),
            tx: None,
            driver: None,
        }
    }

    /// Observe a shared pause switch instead of a private one
    pub fn with_pause_switch(mut self, pause: PauseSwitch) -> Self {
        self.pause = pause;
        self
    }

    /// The worker being driven
    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    /// Identity of the stage
    pub fn key(&self) -> StageKey {
        self.worker.key()
    }

    /// Create the progress channel; must be called before [`StageRun::start`]
    pub fn initialize(&mut self) -> mpsc::Receiver<Progress<W::Output>> {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        self.tx = Some(tx);
        rx
    }

    /// Start driving the worker
    ///
    /// Does nothing when the run was not initialized or is already started.
    pub fn start(&mut self) {
        if self.driver.is_some() {
            tracing::warn!(stage = %self.key(), "stage already started");
            return;
        }
        let Some(tx) = self.tx.take() else {
            tracing::warn!(stage = %self.key(), "stage started before initialize");
            return;
        };

        let worker = Arc::clone(&self.worker);
        let cancel = self.cancel.clone();
        let pause = self.pause.subscribe();
        self.driver = Some(AbortOnDrop(tokio::spawn(drive(
            worker, tx, cancel, pause,
        ))));
    }

    /// Cancel the stage; it emits `Final::Cancelled` once
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Pause the stage (and every stage sharing its switch)
    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Resume the stage (and every stage sharing its switch)
    pub fn resume(&self) {
        self.pause.resume();
    }
}

/// Wait until the switch holds `want`; pends forever if the switch is gone
async fn wait_until(rx: &mut watch::Receiver<bool>, want: bool) {
    loop {
        let current = *rx.borrow_and_update();
        if current == want {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum AttemptEnd<T> {
    Finished(Final<T>),
    Paused,
}

async fn drive<W: StageWorker>(
    worker: Arc<W>,
    tx: mpsc::Sender<Progress<W::Output>>,
    cancel: CancellationToken,
    mut pause: watch::Receiver<bool>,
) {
    let key = worker.key();
    let size = worker.expected_size().await;
    if tx.send(Progress::Initialized { size }).await.is_err() {
        return;
    }

    let outcome = loop {
        match run_attempt(&worker, &tx, &cancel, &mut pause).await {
            Some(AttemptEnd::Finished(outcome)) => break outcome,
            Some(AttemptEnd::Paused) => {
                tracing::debug!(stage = %key, "stage paused");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Final::Cancelled,
                    _ = wait_until(&mut pause, false) => {
                        tracing::debug!(stage = %key, "stage resumed");
                    }
                }
            }
            // Consumer went away
            None => return,
        }
    };

    let _ = tx.send(Progress::Final(outcome)).await;
}

/// Run one attempt until it finishes, is cancelled or is paused
///
/// Returns `None` when the progress receiver was dropped.
async fn run_attempt<W: StageWorker>(
    worker: &Arc<W>,
    tx: &mpsc::Sender<Progress<W::Output>>,
    cancel: &CancellationToken,
    pause: &mut watch::Receiver<bool>,
) -> Option<AttemptEnd<W::Output>> {
    let offset = worker.resume_offset().await;
    let (sink, mut transfer) = ProgressSink::starting_at(offset);
    tx.send(Progress::InProgress {
        downloaded: offset,
        speed: None,
    })
    .await
    .ok()?;

    let attempt = cancel.child_token();
    let mut task = AbortOnDrop(tokio::spawn({
        let worker = Arc::clone(worker);
        let sink = sink.clone();
        let attempt = attempt.clone();
        async move { worker.execute(sink, attempt).await }
    }));
    let started = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt.cancel();
                return Some(AttemptEnd::Finished(Final::Cancelled));
            }
            joined = &mut task.0 => {
                let outcome = match joined {
                    Ok(Ok(data)) => Final::Completed {
                        final_size: sink.downloaded(),
                        data,
                    },
                    Ok(Err(e)) => Final::Failed(e),
                    Err(e) if e.is_panic() => Final::Failed(StageError::new(
                        StageErrorKind::Panicked,
                        worker.kind(),
                        worker.track_id().clone(),
                        "stage panicked",
                    )),
                    Err(e) => Final::Failed(
                        StageError::new(
                            StageErrorKind::Interrupted,
                            worker.kind(),
                            worker.track_id().clone(),
                            "stage task was aborted",
                        )
                        .with_cause(e),
                    ),
                };
                return Some(AttemptEnd::Finished(outcome));
            }
            _ = wait_until(pause, true) => {
                attempt.cancel();
                drop(task);
                tx.send(Progress::Paused { downloaded: sink.downloaded() })
                    .await
                    .ok()?;
                return Some(AttemptEnd::Paused);
            }
            changed = transfer.changed() => {
                if changed.is_err() {
                    continue;
                }
                let downloaded = transfer.borrow_and_update().downloaded;
                let elapsed = started.elapsed().as_secs_f64();
                let speed = (elapsed > 0.0)
                    .then(|| (downloaded.saturating_sub(offset) as f64 / elapsed) as u64);
                tx.send(Progress::InProgress { downloaded, speed })
                    .await
                    .ok()?;
            }
        }
    }
}

/// Map a store error raised inside a stage
pub(crate) fn persistence_error(
    stage: StageKind,
    track_id: &TrackId,
    error: &crate::Error,
) -> StageError {
    StageError::persistence(stage, track_id.clone(), error)
}

/// Error for a record that vanished while its stage was running
pub(crate) fn record_gone(stage: StageKind, track_id: &TrackId) -> StageError {
    StageError::new(
        StageErrorKind::Persistence,
        stage,
        track_id.clone(),
        "download record no longer exists",
    )
}

/// Whether `path` exists on disk
pub(crate) async fn file_exists(path: &std::path::Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Provider context for the record's current state
pub(crate) async fn fresh_context(
    env: &StageEnv,
    track_id: &TrackId,
    stage: StageKind,
) -> Result<(crate::db::DownloadRecord, TrackContext), StageError> {
    let record = env
        .db
        .get_record(track_id)
        .await
        .map_err(|e| persistence_error(stage, track_id, &e))?
        .ok_or_else(|| record_gone(stage, track_id))?;
    let ctx = TrackContext::from_record(&record, &env.config.download);
    Ok((record, ctx))
}
