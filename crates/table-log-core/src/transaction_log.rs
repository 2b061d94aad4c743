//! Append-only transaction log, snapshots, checkpoints and history.
//!
//! This module implements the log layer that gives a directory of data files
//! ACID semantics:
//!
//! - An append-only commit log stored as newline-delimited JSON files under
//!   `_delta_log/`, one file per version, created with *create-if-absent*
//!   semantics so that each version is written exactly once.
//! - Strongly-typed [`Action`]s (add/remove file, metadata, protocol,
//!   commit info) that make up a commit.
//! - [`Snapshot`]s materialized by replaying a checkpoint plus subsequent
//!   commits.
//! - Optimistic [`Transaction`]s that detect and resolve concurrent writers at
//!   commit time.
//! - Checkpointing, retention-driven cleanup and the commit history query.
//!
//! The log is designed to be:
//!
//! - **Append-only**: commits never mutate existing files.
//! - **Gap-free**: version `V + 1` can only be written by a writer that has
//!   seen version `V`.
//! - **Human-inspectable**: every file is plain JSON lines.
//!
//! ## On-disk layout
//!
//! ```text
//! table_root/
//!   _delta_log/
//!     00000000000000000000.json              # version 0: protocol + metaData + ...
//!     00000000000000000001.json              # version 1
//!     ...
//!     00000000000000000010.checkpoint.json   # full state at version 10
//!     00000000000000000010.json
//!     _last_checkpoint                       # {"version":10,"size":42}
//!   part-0000.parquet                        # data files, opaque to the log
//! ```
//!
//! A commit file holds one action per line, for example:
//!
//! ```json
//! {"commitInfo":{"timestamp":1735689600000,"operation":"WRITE","operationParameters":{"mode":"Append"},"readVersion":0}}
//! {"add":{"path":"part-0001.parquet","partitionValues":{},"size":1024,"modificationTime":1735689600000,"dataChange":true}}
//! ```
pub mod actions;
pub mod checkpoint;
pub mod conflict;
pub mod history;
pub mod log_store;
pub mod operation;
pub mod retention;
pub mod snapshot;
pub mod transaction;

pub use actions::{
    Action, AddFile, CommitInfo, Format, IsolationLevel, Metadata, Protocol, RemoveFile,
};
pub use checkpoint::{CheckpointFiles, CheckpointInfo};
pub use conflict::ConflictError;
pub use history::HistoryEntry;
pub use log_store::{CommitEntry, LogFile, TransactionLogStore};
pub use operation::{Operation, SaveMode};
pub use retention::{CleanupPlan, CleanupReport};
pub use snapshot::Snapshot;
pub use transaction::{RetryPolicy, Transaction, TransactionState};

use chrono::{DateTime, Utc};
use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the transaction log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// Another writer already created the commit file for `version`.
    ///
    /// Expected under contention; the transaction layer resolves it and never
    /// surfaces it from [`Transaction::commit`].
    #[snafu(display("Commit for version {version} already exists"))]
    AlreadyExists {
        /// Version that was already taken.
        version: u64,
        /// Underlying create-new failure.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The staged actions collide with a newer committed version, or the
    /// retry budget was exhausted.
    #[snafu(display("Concurrent modification while committing version {version}: {source}"))]
    ConcurrentModification {
        /// Version the transaction last attempted to write.
        version: u64,
        /// What collided.
        source: ConflictError,
    },

    /// The state at `version` can no longer be rebuilt because the commit
    /// files it depends on were removed and no checkpoint covers it.
    #[snafu(display(
        "Version {version} is not reproducible (earliest reproducible version: {earliest:?})"
    ))]
    VersionNotReproducible {
        /// Requested version.
        version: u64,
        /// Earliest version that can still be reconstructed, if any.
        earliest: Option<u64>,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The requested version is newer than anything committed.
    #[snafu(display("Version {version} does not exist (latest version: {latest:?})"))]
    VersionNotFound {
        /// Requested version.
        version: u64,
        /// Latest committed version, if any.
        latest: Option<u64>,
    },

    /// No reproducible version was committed at or before `timestamp`.
    #[snafu(display(
        "No reproducible version at or before {timestamp} (earliest commit time: {earliest:?})"
    ))]
    TimestampOutOfRange {
        /// Requested point in time.
        timestamp: DateTime<Utc>,
        /// Commit time of the earliest reproducible version, if any.
        earliest: Option<DateTime<Utc>>,
    },

    /// The location has no log, or the log carries no valid protocol/metadata.
    #[snafu(display("Not a table: {msg}"))]
    NotATable {
        /// What is missing.
        msg: String,
    },

    /// The table requires a newer protocol than this crate implements.
    #[snafu(display(
        "Table requires {kind} version {required}, but only {supported} is supported"
    ))]
    UnsupportedProtocol {
        /// `reader` or `writer`.
        kind: &'static str,
        /// Version required by the table.
        required: i32,
        /// Highest version this crate supports.
        supported: i32,
    },

    /// The transaction is no longer open (already committed, failed or abandoned).
    #[snafu(display("Transaction is not open (state: {state})"))]
    TransactionClosed {
        /// Description of the state the transaction is in.
        state: String,
    },

    /// Underlying storage error while working with the log.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("Storage error while accessing transaction log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A log file is in an unexpected / malformed state.
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl CommitError {
    /// True when the error is a missing file at the storage layer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommitError::Storage { source } if source.is_not_found())
    }

    /// True for the terminal optimistic-concurrency failure.
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, CommitError::ConcurrentModification { .. })
    }
}

pub(crate) fn check_reader_protocol(protocol: &Protocol) -> Result<(), CommitError> {
    ensure!(
        protocol.min_reader_version <= actions::MAX_SUPPORTED_READER_VERSION,
        UnsupportedProtocolSnafu {
            kind: "reader",
            required: protocol.min_reader_version,
            supported: actions::MAX_SUPPORTED_READER_VERSION,
        }
    );
    Ok(())
}

pub(crate) fn check_writer_protocol(protocol: &Protocol) -> Result<(), CommitError> {
    check_reader_protocol(protocol)?;
    ensure!(
        protocol.min_writer_version <= actions::MAX_SUPPORTED_WRITER_VERSION,
        UnsupportedProtocolSnafu {
            kind: "writer",
            required: protocol.min_writer_version,
            supported: actions::MAX_SUPPORTED_WRITER_VERSION,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_checks_respect_supported_versions() {
        assert!(check_writer_protocol(&Protocol::default()).is_ok());

        let err = check_writer_protocol(&Protocol {
            min_reader_version: 1,
            min_writer_version: 7,
        })
        .expect_err("writer 7 is unsupported");
        assert!(matches!(
            err,
            CommitError::UnsupportedProtocol {
                kind: "writer",
                required: 7,
                ..
            }
        ));

        let err = check_reader_protocol(&Protocol {
            min_reader_version: 3,
            min_writer_version: 7,
        })
        .expect_err("reader 3 is unsupported");
        assert!(matches!(
            err,
            CommitError::UnsupportedProtocol { kind: "reader", .. }
        ));
    }

    #[test]
    fn error_messages_name_the_version() {
        let err = CommitError::VersionNotFound {
            version: 9,
            latest: Some(3),
        };
        assert_eq!(
            err.to_string(),
            "Version 9 does not exist (latest version: Some(3))"
        );
    }
}
