//! Semantic conflict detection between a transaction and a winning commit.
//!
//! When a transaction loses the race for `readVersion + 1`, the commit that
//! won is compared with what the transaction staged and read. Losing the race
//! alone is not a conflict: disjoint appends and removes are rebased onto the
//! winner and retried. What does conflict:
//!
//! 1. the winner changed the protocol;
//! 2. the winner changed the table metadata;
//! 3. both removed the same file;
//! 4. the winner removed a file the transaction read;
//! 5. the winner touched a path the transaction is adding;
//! 6. under `Serializable`, the winner added data while the transaction read
//!    the table.
use std::collections::BTreeSet;

use snafu::prelude::*;

use crate::transaction_log::{Action, IsolationLevel};

/// Why a transaction cannot be rebased onto a concurrently committed version.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ConflictError {
    /// The winning commit changed the protocol.
    #[snafu(display("protocol changed by concurrent commit {winning_version}"))]
    ProtocolChanged {
        /// Version of the winning commit.
        winning_version: u64,
    },

    /// The winning commit changed the table metadata.
    #[snafu(display("metadata changed by concurrent commit {winning_version}"))]
    MetadataChanged {
        /// Version of the winning commit.
        winning_version: u64,
    },

    /// Both transactions removed the same file.
    #[snafu(display("file {path} was also removed by concurrent commit {winning_version}"))]
    ConcurrentDeleteDelete {
        /// Version of the winning commit.
        winning_version: u64,
        /// The contested file.
        path: String,
    },

    /// The winning commit removed a file this transaction read.
    #[snafu(display("file {path} read by this transaction was removed by concurrent commit {winning_version}"))]
    ConcurrentDeleteRead {
        /// Version of the winning commit.
        winning_version: u64,
        /// The contested file.
        path: String,
    },

    /// The winning commit added or removed a path this transaction adds.
    #[snafu(display("file {path} was also written by concurrent commit {winning_version}"))]
    ConcurrentAppendSameFile {
        /// Version of the winning commit.
        winning_version: u64,
        /// The contested file.
        path: String,
    },

    /// Under `Serializable`, the winning commit added data this transaction
    /// should have read.
    #[snafu(display("concurrent commit {winning_version} added data ({path}) read by this serializable transaction"))]
    ConcurrentAppend {
        /// Version of the winning commit.
        winning_version: u64,
        /// First data file added by the winner.
        path: String,
    },

    /// Every retry lost the race again.
    #[snafu(display("gave up after {attempts} commit attempts"))]
    RetriesExhausted {
        /// Number of commit attempts made.
        attempts: u32,
    },
}

/// What a transaction staged and read; the input to conflict detection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransactionFootprint<'a> {
    pub(crate) staged: &'a [Action],
    pub(crate) read_files: &'a BTreeSet<String>,
    pub(crate) read_whole_table: bool,
    pub(crate) isolation_level: IsolationLevel,
}

impl TransactionFootprint<'_> {
    fn removes(&self) -> impl Iterator<Item = &str> {
        self.staged.iter().filter_map(|a| match a {
            Action::Remove(r) => Some(r.path.as_str()),
            _ => None,
        })
    }

    fn adds(&self) -> impl Iterator<Item = &str> {
        self.staged.iter().filter_map(|a| match a {
            Action::Add(f) => Some(f.path.as_str()),
            _ => None,
        })
    }

    fn has_read(&self) -> bool {
        self.read_whole_table || !self.read_files.is_empty()
    }
}

/// Check the footprint against one winning commit.
pub(crate) fn check_winning_commit(
    footprint: &TransactionFootprint<'_>,
    winning_version: u64,
    winning: &[Action],
) -> Result<(), ConflictError> {
    let mut winner_removed = BTreeSet::new();
    let mut winner_added = BTreeSet::new();
    let mut winner_data_add: Option<&str> = None;

    for action in winning {
        match action {
            Action::Protocol(_) => return ProtocolChangedSnafu { winning_version }.fail(),
            Action::Metadata(_) => return MetadataChangedSnafu { winning_version }.fail(),
            Action::Remove(r) => {
                winner_removed.insert(r.path.as_str());
            }
            Action::Add(f) => {
                winner_added.insert(f.path.as_str());
                if f.data_change && winner_data_add.is_none() {
                    winner_data_add = Some(f.path.as_str());
                }
            }
            Action::CommitInfo(_) => {}
        }
    }

    if let Some(path) = footprint.removes().find(|p| winner_removed.contains(p)) {
        return ConcurrentDeleteDeleteSnafu {
            winning_version,
            path,
        }
        .fail();
    }

    if let Some(path) = footprint
        .read_files
        .iter()
        .find(|p| winner_removed.contains(p.as_str()))
    {
        return ConcurrentDeleteReadSnafu {
            winning_version,
            path: path.as_str(),
        }
        .fail();
    }

    if let Some(path) = footprint
        .adds()
        .find(|p| winner_added.contains(p) || winner_removed.contains(p))
    {
        return ConcurrentAppendSameFileSnafu {
            winning_version,
            path,
        }
        .fail();
    }

    if footprint.isolation_level == IsolationLevel::Serializable && footprint.has_read() {
        if let Some(path) = winner_data_add {
            return ConcurrentAppendSnafu {
                winning_version,
                path,
            }
            .fail();
        }
    }

    Ok(())
}
