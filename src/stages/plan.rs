//! Planning of the stage groups a record still needs
//!
//! Planning is pure: it reads the record's frontier and asks `exists` whether
//! each recorded file is still on disk. A file that vanished counts as never
//! produced, so the stage that made it runs again.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db::DownloadRecord;
use crate::types::StageKind;

/// One stage to run for a track
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePlan {
    /// Load metadata, stream and sources
    Load,
    /// Fetch one source part
    Download {
        /// Source index to fetch
        source_index: usize,
    },
    /// Merge the fetched parts
    Merge,
    /// Tag the merged file
    Tag,
    /// Save the tagged file
    Save,
}

impl StagePlan {
    /// Stage kind of this plan entry
    pub fn kind(&self) -> StageKind {
        match self {
            StagePlan::Load => StageKind::Load,
            StagePlan::Download { .. } => StageKind::Download,
            StagePlan::Merge => StageKind::Merge,
            StagePlan::Tag => StageKind::Tag,
            StagePlan::Save => StageKind::Save,
        }
    }
}

/// A group of stages that run concurrently
pub type QueueItem = Vec<StagePlan>;

/// The group every fresh or resumed track starts with
pub fn load_only() -> Vec<QueueItem> {
    vec![vec![StagePlan::Load]]
}

/// Stage groups still needed to finish `record`
pub fn plan_remaining(record: &DownloadRecord, exists: impl Fn(&Path) -> bool) -> Vec<QueueItem> {
    if record.final_file.is_some() {
        return Vec::new();
    }

    if record.tagged_file.as_deref().is_some_and(&exists) {
        return vec![vec![StagePlan::Save]];
    }

    if record.merged_file.as_deref().is_some_and(&exists) {
        return vec![vec![StagePlan::Tag], vec![StagePlan::Save]];
    }

    let downloads: QueueItem = record
        .source_indexes
        .iter()
        .filter(|&&index| !record.partial_file(index).is_some_and(|p| exists(p.as_path())))
        .map(|&source_index| StagePlan::Download { source_index })
        .collect();

    let mut groups = Vec::with_capacity(4);
    if !downloads.is_empty() {
        groups.push(downloads);
    }
    groups.push(vec![StagePlan::Merge]);
    groups.push(vec![StagePlan::Tag]);
    groups.push(vec![StagePlan::Save]);
    groups
}
