//! Retention: deleting log files that are no longer needed.
//!
//! Commit files carry no logical expiry, so their modification time is used as
//! the age signal. Given a cutoff instant, a commit file is deleted only when
//!
//! - a complete checkpoint exists at a newer version `K`, so every version
//!   from `K` on can be rebuilt without it, and
//! - it is older than the cutoff.
//!
//! Deletion works on the oldest end of the log and stops at the first commit
//! that is too young, so the surviving commits stay contiguous. Commit `K` and
//! everything after it are never touched. Checkpoints older than `K` are
//! deleted once they are past the cutoff too.
use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::storage::{self, layout::LogFileKind};
use crate::transaction_log::checkpoint::complete_checkpoints;
use crate::transaction_log::{CommitError, LogFile, StorageSnafu, TransactionLogStore};

/// Files selected for deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    /// Newest complete checkpoint; nothing at or after it is deleted.
    pub checkpoint_version: Option<u64>,
    /// Expired commit files, oldest first.
    pub commits: Vec<LogFile>,
    /// Expired checkpoint files (every part), oldest first.
    pub checkpoints: Vec<LogFile>,
}

impl CleanupPlan {
    /// Whether there is nothing to delete.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.checkpoints.is_empty()
    }

    /// Number of files to delete.
    pub fn len(&self) -> usize {
        self.commits.len() + self.checkpoints.len()
    }

    /// Every file in the plan, commits first.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.commits.iter().chain(self.checkpoints.iter())
    }
}

/// What a cleanup run deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Versions whose commit files were deleted.
    pub deleted_commits: Vec<u64>,
    /// Versions whose checkpoint files were deleted.
    pub deleted_checkpoints: Vec<u64>,
    /// Earliest reproducible version after the cleanup.
    pub retained_from: Option<u64>,
}

impl TransactionLogStore {
    /// Plan which log files are expired at `cutoff`.
    pub async fn expired_log_files(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupPlan, CommitError> {
        let files = self.list_log_files().await?;

        let Some(newest_checkpoint) = complete_checkpoints(&files).last().map(|cp| cp.version)
        else {
            log::debug!("no complete checkpoint; nothing is eligible for cleanup");
            return Ok(CleanupPlan::default());
        };

        // `files` is sorted by kind, so commits come first in version order.
        let commits: Vec<LogFile> = files
            .iter()
            .filter(|f| matches!(f.kind, LogFileKind::Commit(v) if v < newest_checkpoint))
            .take_while(|f| f.meta.modified < cutoff)
            .cloned()
            .collect();

        let checkpoints: Vec<LogFile> = files
            .iter()
            .filter(|f| {
                matches!(
                    f.kind,
                    LogFileKind::Checkpoint(_) | LogFileKind::CheckpointPart { .. }
                ) && f.kind.version() < newest_checkpoint
                    && f.meta.modified < cutoff
            })
            .cloned()
            .collect();

        Ok(CleanupPlan {
            checkpoint_version: Some(newest_checkpoint),
            commits,
            checkpoints,
        })
    }

    /// Delete the log files that are expired at `cutoff`.
    ///
    /// Files that are already gone are not an error. Commits are deleted oldest
    /// first, so an interrupted run still leaves a contiguous log.
    pub async fn cleanup_expired_logs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupReport, CommitError> {
        let plan = self.expired_log_files(cutoff).await?;
        let mut report = CleanupReport::default();

        for file in plan.files() {
            storage::delete_if_exists(self.location().as_ref(), &file.rel_path)
                .await
                .context(StorageSnafu)?;
            match file.kind {
                LogFileKind::Commit(v) => report.deleted_commits.push(v),
                other => {
                    if report.deleted_checkpoints.last() != Some(&other.version()) {
                        report.deleted_checkpoints.push(other.version());
                    }
                }
            }
        }

        report.retained_from = self.earliest_reproducible_version().await?;
        if !plan.is_empty() {
            log::info!(
                "log cleanup deleted {} commit(s) and {} checkpoint file(s); history now starts at {:?}",
                report.deleted_commits.len(),
                plan.checkpoints.len(),
                report.retained_from
            );
        }
        Ok(report)
    }
}
