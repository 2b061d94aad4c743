//! Commit history ("describe history").
//!
//! History is read newest first, one entry per commit, from the `commitInfo`
//! action of each commit file. Versions removed by retention end the walk
//! (retention only ever deletes the oldest end of the log), and commits that
//! exist but cannot be read are skipped with a warning rather than failing the
//! query.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transaction_log::{
    Action, CommitEntry, CommitError, CommitInfo, IsolationLevel, TimestampOutOfRangeSnafu,
    TransactionLogStore,
};

/// One row of commit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Committed version.
    pub version: u64,
    /// Commit time; the commit file's modification time when the commit
    /// recorded none.
    pub timestamp: DateTime<Utc>,
    /// Operation name, if recorded.
    pub operation: Option<String>,
    /// Operation parameters, if recorded.
    pub operation_parameters: Option<BTreeMap<String, String>>,
    /// Version the committing transaction last reconciled against.
    pub read_version: Option<u64>,
    /// Isolation level of the committing transaction.
    pub isolation_level: Option<IsolationLevel>,
    /// Whether the commit was a blind append.
    pub is_blind_append: Option<bool>,
    /// Operation metrics; values are stringified counts.
    pub operation_metrics: Option<BTreeMap<String, String>>,
    /// Caller-supplied metadata.
    pub user_metadata: Option<String>,
}

impl HistoryEntry {
    fn from_commit(entry: &CommitEntry, info: Option<CommitInfo>) -> Self {
        let info = info.unwrap_or_default();
        Self {
            version: entry.version,
            timestamp: info.timestamp_utc().unwrap_or(entry.meta.modified),
            operation: info.operation,
            operation_parameters: info.operation_parameters,
            read_version: info.read_version,
            isolation_level: info.isolation_level,
            is_blind_append: info.is_blind_append,
            operation_metrics: info.operation_metrics,
            user_metadata: info.user_metadata,
        }
    }
}

impl TransactionLogStore {
    /// The history entry of a single commit.
    ///
    /// Returns `None` if the commit file does not exist.
    pub async fn history_entry(&self, version: u64) -> Result<Option<HistoryEntry>, CommitError> {
        let Some(entry) = self.commit_entry(version).await? else {
            return Ok(None);
        };
        let actions = self.read_commit(version).await?;
        let info = actions.into_iter().find_map(|a| match a {
            Action::CommitInfo(info) => Some(info),
            _ => None,
        });
        Ok(Some(HistoryEntry::from_commit(&entry, info)))
    }

    /// Commit history, newest first, at most `limit` entries.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, CommitError> {
        let mut out = Vec::new();
        if limit == Some(0) {
            return Ok(out);
        }
        let Some(latest) = self.latest_version().await? else {
            return Ok(out);
        };

        for version in (0..=latest).rev() {
            match self.history_entry(version).await {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => break,
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    log::warn!("skipping unreadable commit {version} in history: {e}");
                    continue;
                }
            }
            if limit.is_some_and(|n| out.len() >= n) {
                break;
            }
        }
        Ok(out)
    }

    /// Newest reproducible version committed at or before `timestamp`.
    ///
    /// # Errors
    /// [`CommitError::TimestampOutOfRange`] if every reproducible version is
    /// newer than `timestamp`, or the log is empty.
    pub async fn version_at_or_before(&self, timestamp: DateTime<Utc>) -> Result<u64, CommitError> {
        let earliest = self.earliest_reproducible_version().await?;
        let (Some(earliest), Some(latest)) = (earliest, self.latest_version().await?) else {
            return Err(CommitError::TimestampOutOfRange {
                timestamp,
                earliest: None,
            });
        };

        let mut earliest_time = None;
        for version in (earliest..=latest).rev() {
            let entry = match self.history_entry(version).await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    log::warn!("skipping unreadable commit {version}: {e}");
                    continue;
                }
            };
            if entry.timestamp <= timestamp {
                return Ok(version);
            }
            earliest_time = Some(entry.timestamp);
        }

        TimestampOutOfRangeSnafu {
            timestamp,
            earliest: earliest_time,
        }
        .fail()
    }
}
