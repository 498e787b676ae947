//! Task runner: one stage execution, persisted before it is published
//!
//! The runner consumes a [`StageRun`]'s progress stream. Every accepted value
//! is written to the record first and only then published to the combined
//! progress feed and the event channel, so an observer never sees a state
//! the store does not hold yet.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::db::{Database, RecordProgress, StageOutput};
use crate::error::{StageError, StageErrorKind};
use crate::progress::{Final, Progress, ProgressGuard};
use crate::scheduler::{ProgressFeed, ProgressHub};
use crate::stages::{StageRun, StageWorker};
use crate::types::{Event, StageKey, Status};

/// How a stage execution ended, when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<T> {
    /// The stage produced its output and the output is persisted
    Completed(T),
    /// The stage was cancelled, or its record was deleted while it ran
    Cancelled,
}

impl<T> StageOutcome<T> {
    /// Map the completed output
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            StageOutcome::Completed(output) => StageOutcome::Completed(f(output)),
            StageOutcome::Cancelled => StageOutcome::Cancelled,
        }
    }
}

/// Drives one [`StageRun`] to completion, persisting every transition
pub struct TaskRunner<W: StageWorker> {
    run: StageRun<W>,
    db: Arc<Database>,
    events: broadcast::Sender<Event>,
    hub: Option<Arc<ProgressHub>>,
}

impl<W: StageWorker> TaskRunner<W> {
    /// Create a runner for `run`
    pub fn new(run: StageRun<W>, db: Arc<Database>, events: broadcast::Sender<Event>) -> Self {
        Self {
            run,
            db,
            events,
            hub: None,
        }
    }

    /// Publish progress values to a combined feed
    pub fn with_hub(mut self, hub: Arc<ProgressHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Run the stage until it reaches a final value
    ///
    /// Returns `Err` with the persisted error when the stage failed, or with
    /// kind `Persistence` when the store could not be written.
    pub async fn run(mut self) -> Result<StageOutcome<W::Output>, StageError> {
        let key = self.run.key();
        let worker = Arc::clone(self.run.worker());
        let mut rx = self.run.initialize();
        self.run.start();

        let mut guard = ProgressGuard::new();
        let mut feed: Option<ProgressFeed> = None;

        while let Some(value) = rx.recv().await {
            if let Err(violation) = guard.check(&value) {
                tracing::warn!(
                    stage = %key,
                    value = value.name(),
                    %violation,
                    "ignoring illegal progress value"
                );
                continue;
            }

            let outcome = match value {
                Progress::Final(outcome) => outcome,
                value => {
                    match self.persist(&key, &value).await {
                        Ok(Some(record)) => {
                            self.publish(&key, &mut feed, value.erase());
                            self.events.send(record.to_event(&key.track_id, key.stage)).ok();
                        }
                        Ok(None) => return Ok(self.record_gone(&key, &mut feed)),
                        Err(e) => return Err(self.persistence_failure(&key, &mut feed, &e).await),
                    }
                    continue;
                }
            };

            return match outcome {
                Final::Completed { final_size, data } => {
                    self.complete(&key, &worker, &mut feed, final_size, data)
                        .await
                }
                Final::Cancelled => self.cancelled(&key, &mut feed).await,
                Final::Failed(error) => self.fail(&key, &mut feed, error).await,
            };
        }

        let error = StageError::new(
            StageErrorKind::Interrupted,
            key.stage,
            key.track_id.clone(),
            "progress stream ended without a final value",
        );
        self.fail(&key, &mut feed, error).await
    }

    /// Write a non-final value; `None` means the record no longer exists
    async fn persist(
        &self,
        key: &StageKey,
        value: &Progress<W::Output>,
    ) -> crate::Result<Option<RecordProgress>> {
        let track_id = &key.track_id;
        tracing::debug!(stage = %key, value = value.name(), "persisting progress");

        match (key.source_index, value) {
            (Some(index), Progress::Initialized { size }) => {
                self.db.apply_source_initialized(track_id, index, *size).await
            }
            (Some(index), Progress::InProgress { downloaded, speed }) => {
                self.db
                    .apply_source_progress(track_id, index, *downloaded, *speed, Status::Progressing)
                    .await
            }
            (Some(index), Progress::Paused { downloaded }) => {
                self.db
                    .apply_source_progress(track_id, index, *downloaded, None, Status::Paused)
                    .await
            }
            (None, Progress::Initialized { .. }) => self.db.apply_initialized(track_id).await,
            (None, Progress::InProgress { downloaded, speed }) => {
                self.db
                    .apply_stage_progress(track_id, *downloaded, *speed, Status::Progressing)
                    .await
            }
            (None, Progress::Paused { downloaded }) => {
                self.db
                    .apply_stage_progress(track_id, *downloaded, None, Status::Paused)
                    .await
            }
            (_, Progress::Final(_)) => self.db.record_progress(track_id).await,
        }
    }

    fn publish(&self, key: &StageKey, feed: &mut Option<ProgressFeed>, value: Progress<()>) {
        let Some(hub) = &self.hub else {
            return;
        };
        match feed {
            Some(feed) => feed.publish(value),
            None => *feed = Some(hub.register(key.clone(), value)),
        }
    }

    async fn complete(
        &mut self,
        key: &StageKey,
        worker: &Arc<W>,
        feed: &mut Option<ProgressFeed>,
        final_size: u64,
        data: W::Output,
    ) -> Result<StageOutcome<W::Output>, StageError> {
        let track_id = &key.track_id;
        let commit = worker.output_commit(&data);
        let written = match &commit {
            Some(output) => self.db.commit_stage_output(track_id, output).await,
            None => self.db.record_progress(track_id).await,
        };

        let record = match written {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(self.record_gone(key, feed)),
            Err(e) => return Err(self.persistence_failure(key, feed, &e).await),
        };

        tracing::info!(
            track_id = %track_id,
            stage = %key.stage,
            source_index = ?key.source_index,
            final_size,
            "stage completed"
        );

        self.publish(
            key,
            feed,
            Progress::Final(Final::Completed {
                final_size,
                data: (),
            }),
        );
        self.events.send(record.to_event(track_id, key.stage)).ok();
        self.events
            .send(Event::StageCompleted {
                track_id: track_id.clone(),
                stage: key.stage,
                source_index: key.source_index,
            })
            .ok();
        if let Some(StageOutput::Saved(path)) = commit {
            self.events
                .send(Event::Completed {
                    track_id: track_id.clone(),
                    path,
                })
                .ok();
        }

        worker.after_commit(&data).await;
        Ok(StageOutcome::Completed(data))
    }

    async fn cancelled(
        &mut self,
        key: &StageKey,
        feed: &mut Option<ProgressFeed>,
    ) -> Result<StageOutcome<W::Output>, StageError> {
        match self.db.delete_record(&key.track_id).await {
            Ok(deleted) => {
                self.publish(key, feed, Progress::Final(Final::Cancelled));
                if deleted {
                    tracing::info!(track_id = %key.track_id, stage = %key.stage, "track cancelled");
                    self.events
                        .send(Event::Removed {
                            track_id: key.track_id.clone(),
                        })
                        .ok();
                }
                Ok(StageOutcome::Cancelled)
            }
            Err(e) => Err(self.persistence_failure(key, feed, &e).await),
        }
    }

    async fn fail(
        &mut self,
        key: &StageKey,
        feed: &mut Option<ProgressFeed>,
        error: StageError,
    ) -> Result<StageOutcome<W::Output>, StageError> {
        let track_id = &key.track_id;
        let error = match error.record_status {
            Some(_) => error,
            None => match self.db.record_progress(track_id).await {
                Ok(Some(current)) => error.with_status(Status::from_i32(current.status)),
                _ => error,
            },
        };

        let record = match self.db.mark_failed(track_id, &error).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(self.record_gone(key, feed)),
            Err(e) => return Err(self.persistence_failure(key, feed, &e).await),
        };

        tracing::error!(
            track_id = %track_id,
            stage = %key.stage,
            source_index = ?key.source_index,
            kind = error.kind.as_str(),
            error = %error.message,
            "stage failed"
        );

        self.publish(key, feed, Progress::Final(Final::Failed(error.clone())));
        self.events.send(record.to_event(track_id, key.stage)).ok();
        self.events
            .send(Event::Failed {
                track_id: track_id.clone(),
                error: error.clone(),
            })
            .ok();
        Err(error)
    }

    /// The record was deleted underneath the stage; stop without writing
    fn record_gone(
        &mut self,
        key: &StageKey,
        feed: &mut Option<ProgressFeed>,
    ) -> StageOutcome<W::Output> {
        tracing::info!(stage = %key, "record deleted while stage was running");
        self.run.cancel();
        self.publish(key, feed, Progress::Final(Final::Cancelled));
        StageOutcome::Cancelled
    }

    /// The store could not be written: stop the stage and try to mark the track failed
    async fn persistence_failure(
        &mut self,
        key: &StageKey,
        feed: &mut Option<ProgressFeed>,
        cause: &crate::Error,
    ) -> StageError {
        self.run.cancel();
        let error = StageError::persistence(key.stage, key.track_id.clone(), cause);
        tracing::error!(stage = %key, error = %cause, "failed to persist stage progress");

        if let Err(e) = self.db.mark_failed(&key.track_id, &error).await {
            tracing::warn!(stage = %key, error = %e, "failed to record persistence failure");
        }
        self.publish(key, feed, Progress::Final(Final::Failed(error.clone())));
        self.events
            .send(Event::Failed {
                track_id: key.track_id.clone(),
                error: error.clone(),
            })
            .ok();
        error
    }
}
