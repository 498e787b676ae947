//! Stage progress model
//!
//! Every stage execution emits a stream of [`Progress`] values:
//!
//! ```text
//! Initialized ──► InProgress ──┬──► InProgress (recurs)
//!                              ├──► Paused ──► InProgress
//!                              └──► Final(Completed | Cancelled | Failed)
//! ```
//!
//! [`ProgressGuard`] checks that an observed sequence follows these edges.
//! Providers never build `Progress` values themselves; they report byte counts
//! through a [`ProgressSink`] and the stage driver turns those into
//! `InProgress` values.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::StageError;

/// Progress of one stage execution, parameterized by the stage's result type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Progress<T> {
    /// Entry state; `size` is the expected final byte size when knowable
    Initialized {
        /// Expected size in bytes
        size: Option<u64>,
    },
    /// Work is running
    InProgress {
        /// Bytes processed so far
        downloaded: u64,
        /// Current throughput in bytes per second
        speed: Option<u64>,
    },
    /// Paused by the user; only reachable from `InProgress`
    Paused {
        /// Bytes processed when the pause took effect
        downloaded: u64,
    },
    /// Terminal value; nothing may follow it
    Final(Final<T>),
}

/// Terminal outcome of a stage execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Final<T> {
    /// Stage produced its output
    Completed {
        /// Bytes produced by the final attempt
        final_size: u64,
        /// Stage output
        data: T,
    },
    /// Stage was cancelled
    Cancelled,
    /// Stage failed
    Failed(StageError),
}

impl<T> Progress<T> {
    /// Whether this is a terminal value
    pub fn is_final(&self) -> bool {
        matches!(self, Progress::Final(_))
    }

    /// Short name of the variant, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Progress::Initialized { .. } => "initialized",
            Progress::InProgress { .. } => "in_progress",
            Progress::Paused { .. } => "paused",
            Progress::Final(Final::Completed { .. }) => "completed",
            Progress::Final(Final::Cancelled) => "cancelled",
            Progress::Final(Final::Failed(_)) => "failed",
        }
    }

    /// Same value with the stage output dropped, as published to observers
    pub fn erase(&self) -> Progress<()> {
        match self {
            Progress::Initialized { size } => Progress::Initialized { size: *size },
            Progress::InProgress { downloaded, speed } => Progress::InProgress {
                downloaded: *downloaded,
                speed: *speed,
            },
            Progress::Paused { downloaded } => Progress::Paused {
                downloaded: *downloaded,
            },
            Progress::Final(Final::Completed { final_size, .. }) => {
                Progress::Final(Final::Completed {
                    final_size: *final_size,
                    data: (),
                })
            }
            Progress::Final(Final::Cancelled) => Progress::Final(Final::Cancelled),
            Progress::Final(Final::Failed(e)) => Progress::Final(Final::Failed(e.clone())),
        }
    }
}

/// A progress value that breaks the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    /// A value arrived after a terminal value
    #[error("value after final")]
    AfterFinal,
    /// `Initialized` arrived a second time
    #[error("initialized twice")]
    InitializedTwice,
    /// `InProgress` or `Paused` arrived before `Initialized`
    #[error("not initialized")]
    NotInitialized,
    /// `Paused` arrived without a preceding `InProgress`
    #[error("paused before in-progress")]
    PausedBeforeProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Initialized,
    Running,
    Paused,
    Finished,
}

/// Legality checker for one progress stream
///
/// Feed every observed value through [`ProgressGuard::check`]; rejected values
/// must be logged and ignored by the consumer.
#[derive(Debug, Clone)]
pub struct ProgressGuard {
    phase: Phase,
}

impl Default for ProgressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressGuard {
    /// Guard for a stream that has not emitted anything yet
    pub fn new() -> Self {
        Self {
            phase: Phase::Fresh,
        }
    }

    /// Whether a terminal value has been accepted
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Accept `value` and advance, or reject it without changing state
    pub fn check<T>(&mut self, value: &Progress<T>) -> Result<(), Violation> {
        let next = match (self.phase, value) {
            (Phase::Finished, _) => return Err(Violation::AfterFinal),
            (_, Progress::Final(_)) => Phase::Finished,
            (Phase::Fresh, Progress::Initialized { .. }) => Phase::Initialized,
            (_, Progress::Initialized { .. }) => return Err(Violation::InitializedTwice),
            (Phase::Fresh, _) => return Err(Violation::NotInitialized),
            (_, Progress::InProgress { .. }) => Phase::Running,
            (Phase::Running, Progress::Paused { .. }) => Phase::Paused,
            (_, Progress::Paused { .. }) => return Err(Violation::PausedBeforeProgress),
        };
        self.phase = next;
        Ok(())
    }
}

/// Byte counters reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes processed so far, including any resumed offset
    pub downloaded: u64,
    /// Expected total, if the provider knows it
    pub total: Option<u64>,
}

/// Provider-facing progress reporter
///
/// Updates are coalesced: the stage driver only sees the latest counters,
/// never a backlog.
#[derive(Clone, Debug)]
pub struct ProgressSink {
    tx: Arc<watch::Sender<Transfer>>,
}

impl ProgressSink {
    /// Create a sink starting at `offset` bytes, with the receiving end
    pub fn starting_at(offset: u64) -> (Self, watch::Receiver<Transfer>) {
        let (tx, rx) = watch::channel(Transfer {
            downloaded: offset,
            total: None,
        });
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Create a detached sink, for provider calls nobody observes
    pub fn detached() -> Self {
        Self::starting_at(0).0
    }

    /// Set the expected total size
    pub fn set_total(&self, total: u64) {
        self.tx.send_modify(|t| t.total = Some(total));
    }

    /// Set the absolute number of bytes processed
    pub fn set_downloaded(&self, downloaded: u64) {
        self.tx.send_modify(|t| t.downloaded = downloaded);
    }

    /// Add to the number of bytes processed
    pub fn add_downloaded(&self, bytes: u64) {
        self.tx
            .send_modify(|t| t.downloaded = t.downloaded.saturating_add(bytes));
    }

    /// Latest reported counters
    pub fn transfer(&self) -> Transfer {
        *self.tx.borrow()
    }

    /// Latest reported byte count
    pub fn downloaded(&self) -> u64 {
        self.tx.borrow().downloaded
    }
}
