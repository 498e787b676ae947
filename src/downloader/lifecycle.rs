//! Resumption scans and shutdown coordination.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::scheduler::ResumeReport;
use crate::types::Event;

use super::TrackDownloader;

impl TrackDownloader {
    /// Gracefully shut down the downloader
    ///
    /// This method performs the shutdown sequence:
    /// 1. Stops accepting new requests
    /// 2. Emits [`Event::Shutdown`]
    /// 3. Stops every track job and background scan; records are left as they
    ///    are, so the next start resumes them from their last committed output
    /// 4. Marks the clean shutdown in the database
    ///
    /// # Errors
    ///
    /// Returns an error if the clean-shutdown flag cannot be written.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.accepting_new.store(false, Ordering::SeqCst);
        self.emit_event(Event::Shutdown);

        self.scheduler.shutdown().await;
        tracing::info!("Stopped all track jobs");

        self.db.set_clean_shutdown().await?;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Re-enqueue unfinished records that have no job
    ///
    /// Runs automatically at start-up and, when `download.resume_scan_interval`
    /// is set, periodically.
    pub async fn resume_scan(&self) -> Result<ResumeReport> {
        self.ensure_accepting()?;
        self.scheduler.resume_scan().await
    }

    /// Whether new requests are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }
}
