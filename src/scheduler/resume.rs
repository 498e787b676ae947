//! Resumption scan: picks up records left unfinished by an earlier run

use serde::Serialize;
use std::time::Duration;
use utoipa::ToSchema;

use super::Scheduler;
use crate::error::{Error, Result};
use crate::stages::complete_context_if_done;
use crate::stages::plan::load_only;
use crate::types::Status;

/// What a resumption scan did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ResumeReport {
    /// Records re-enqueued from the Load stage
    pub resumed: usize,
    /// Contexts whose completion had not been recorded
    pub contexts_completed: usize,
}

impl Scheduler {
    /// Re-enqueue every unfinished, unpaused record that has no job
    ///
    /// Load skips the sub-steps a record already has, so a resumed track
    /// continues from its last committed stage output. Also completes contexts
    /// whose tracks are all saved but whose completion was never recorded.
    pub async fn resume_scan(&self) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();

        for record in self.db.list_unfinished_records().await? {
            if record.status == Status::Paused || self.is_tracked(&record.track_id) {
                continue;
            }
            match self.enqueue(record.track_id.clone(), &record.extension_id, load_only()) {
                Ok(()) => report.resumed += 1,
                Err(Error::AlreadyQueued(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        track_id = %record.track_id,
                        extension_id = %record.extension_id,
                        error = %e,
                        "cannot resume track"
                    );
                }
            }
        }

        for context in self.db.list_pending_contexts().await? {
            let handle = match self.providers.resolve(&context.extension_id) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(context_id = %context.context_id, error = %e, "cannot complete context");
                    continue;
                }
            };
            if complete_context_if_done(
                &self.db,
                handle.provider.as_ref(),
                &self.events,
                &context.context_id,
            )
            .await?
            {
                report.contexts_completed += 1;
            }
        }

        if report != ResumeReport::default() {
            tracing::info!(
                resumed = report.resumed,
                contexts_completed = report.contexts_completed,
                "resumption scan finished"
            );
        }
        Ok(report)
    }

    /// Run [`Scheduler::resume_scan`] every `interval` until shutdown
    pub fn spawn_resume_scanner(&self, interval: Duration) {
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the start-up scan already ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.resume_scan().await {
                    tracing::error!(error = %e, "resumption scan failed");
                }
            }
        });
        self.track_background(task);
    }
}
