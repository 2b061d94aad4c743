//! Async helpers for persisting and reading the commit log.
//!
//! This module owns all on-disk interactions with `_delta_log/` commit files:
//! - Writing zero-padded commit files with *create-if-absent* semantics so
//!   each version is created exactly once, by exactly one writer.
//! - Reading a commit back into its ordered [`Action`]s.
//! - Enumerating committed versions, either lazily by probing consecutive
//!   versions ([`TransactionLogStore::list_commits`]) or through a full
//!   directory listing ([`TransactionLogStore::list_log_files`]) for callers
//!   that need checkpoints and modification times too.
//! - Mapping storage-layer failures into [`CommitError`] variants so callers
//!   can differentiate between lost races, storage errors, and corrupt files.
//!
//! Higher-level planning (which actions to commit, conflict resolution) is
//! left to the caller.
use std::path::PathBuf;

use futures::Stream;
use snafu::{Backtrace, prelude::*};

use crate::storage::{self, FileMeta, TableLocation, layout, layout::LogFileKind};
use crate::transaction_log::actions::{self, Action};
use crate::transaction_log::{CommitError, StorageSnafu};

/// Helper for reading and writing the commit log under a table root.
///
/// Layout:
///   <root>/_delta_log/00000000000000000000.json
///   <root>/_delta_log/00000000000000000001.json
///   <root>/_delta_log/_last_checkpoint
#[derive(Debug, Clone)]
pub struct TransactionLogStore {
    location: TableLocation,
}

/// A committed version located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    /// Committed version.
    pub version: u64,
    /// Path of the commit file relative to the table root.
    pub rel_path: PathBuf,
    /// Size and modification time of the commit file.
    pub meta: FileMeta,
}

/// A protocol file found by a directory listing of `_delta_log/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// What the file is.
    pub kind: LogFileKind,
    /// Path relative to the table root.
    pub rel_path: PathBuf,
    /// Size and modification time.
    pub meta: FileMeta,
}

impl TransactionLogStore {
    /// Create a new TransactionLogStore rooted at a table directory.
    pub fn new(location: TableLocation) -> Self {
        Self { location }
    }

    /// Get the TableLocation of the LogStore.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// Whether `_delta_log/` exists under the table root.
    pub async fn log_dir_exists(&self) -> Result<bool, CommitError> {
        storage::dir_exists(self.location.as_ref(), &layout::log_rel_dir())
            .await
            .context(StorageSnafu)
    }

    /// Atomically create the commit file for `version`.
    ///
    /// - If another writer already created it, returns
    ///   [`CommitError::AlreadyExists`] and leaves the existing file untouched.
    /// - On other storage failures, returns [`CommitError::Storage`].
    ///
    /// Readers never observe a partially written commit.
    pub async fn write_commit(&self, version: u64, actions: &[Action]) -> Result<(), CommitError> {
        let bytes = actions::encode_actions(actions).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        let rel = layout::commit_rel_path(version);
        match storage::write_new(self.location.as_ref(), &rel, &bytes).await {
            Ok(()) => {
                log::debug!(
                    "wrote commit {version} ({} actions) at {}",
                    actions.len(),
                    rel.display()
                );
                Ok(())
            }
            Err(source) if source.is_already_exists() => {
                log::debug!("commit {version} already exists");
                Err(CommitError::AlreadyExists { version, source })
            }
            Err(source) => Err(CommitError::Storage { source }),
        }
    }

    /// Load the actions of a single commit, in file order.
    ///
    /// - On storage-layer failures (including a missing file), returns
    ///   `CommitError::Storage`; use [`CommitError::is_not_found`] to tell a
    ///   missing commit apart.
    /// - On parse failures, returns `CommitError::CorruptState`.
    pub async fn read_commit(&self, version: u64) -> Result<Vec<Action>, CommitError> {
        let rel = layout::commit_rel_path(version);
        let text = storage::read_to_string(self.location.as_ref(), &rel)
            .await
            .context(StorageSnafu)?;

        actions::decode_actions(&text).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to parse commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Locate the commit file for `version`, or `None` if it does not exist.
    pub async fn commit_entry(&self, version: u64) -> Result<Option<CommitEntry>, CommitError> {
        let rel = layout::commit_rel_path(version);
        match storage::stat(self.location.as_ref(), &rel).await {
            Ok(meta) => Ok(Some(CommitEntry {
                version,
                rel_path: rel,
                meta,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(CommitError::Storage { source }),
        }
    }

    /// Whether the commit file for `version` exists.
    pub async fn commit_exists(&self, version: u64) -> Result<bool, CommitError> {
        Ok(self.commit_entry(version).await?.is_some())
    }

    async fn next_commit(
        &self,
        next: Option<u64>,
    ) -> Result<Option<(CommitEntry, Option<u64>)>, CommitError> {
        let Some(version) = next else {
            return Ok(None);
        };
        Ok(self
            .commit_entry(version)
            .await?
            .map(|entry| (entry, version.checked_add(1))))
    }

    /// Enumerate committed versions starting at `from`, in ascending order.
    ///
    /// The stream probes consecutive versions and ends at the first version
    /// that has no commit file, so it is finite and never yields a version
    /// whose write has not completed. It does not list the directory; calling
    /// it again with any `from` restarts the enumeration.
    pub fn list_commits(
        &self,
        from: u64,
    ) -> impl Stream<Item = Result<CommitEntry, CommitError>> + '_ {
        futures::stream::try_unfold(Some(from), move |next| self.next_commit(next))
    }

    /// List every protocol file under `_delta_log/`, sorted by version and kind.
    ///
    /// Temporary files, `_last_checkpoint` and foreign names are skipped.
    pub async fn list_log_files(&self) -> Result<Vec<LogFile>, CommitError> {
        let log_dir = layout::log_rel_dir();
        let entries = storage::list_dir(self.location.as_ref(), &log_dir)
            .await
            .context(StorageSnafu)?;

        let mut files: Vec<LogFile> = entries
            .into_iter()
            .filter_map(|entry| {
                LogFileKind::parse(&entry.name).map(|kind| LogFile {
                    kind,
                    rel_path: log_dir.join(&entry.name),
                    meta: entry.meta,
                })
            })
            .collect();
        files.sort_by(|a, b| a.kind.cmp(&b.kind));
        Ok(files)
    }

    /// Latest committed version, or `None` if the log holds no commits.
    ///
    /// Starts from the `_last_checkpoint` hint and probes forward; without a
    /// usable hint it falls back to a directory listing.
    pub async fn latest_version(&self) -> Result<Option<u64>, CommitError> {
        if let Some(hint) = self.read_last_checkpoint().await? {
            if self.commit_exists(hint.version).await? {
                let mut version = hint.version;
                while let Some(next) = version.checked_add(1) {
                    if !self.commit_exists(next).await? {
                        break;
                    }
                    version = next;
                }
                return Ok(Some(version));
            }
            log::debug!(
                "_last_checkpoint points at version {} which has no commit file; listing log",
                hint.version
            );
        }

        let latest = self
            .list_log_files()
            .await?
            .iter()
            .filter_map(|f| match f.kind {
                LogFileKind::Commit(v) => Some(v),
                _ => None,
            })
            .max();
        Ok(latest)
    }

    /// Smallest commit version still present on disk.
    pub async fn earliest_commit_version(&self) -> Result<Option<u64>, CommitError> {
        let earliest = self
            .list_log_files()
            .await?
            .iter()
            .filter_map(|f| match f.kind {
                LogFileKind::Commit(v) => Some(v),
                _ => None,
            })
            .min();
        Ok(earliest)
    }
}
