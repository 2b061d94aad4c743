//! Error types and SNAFU context selectors for `table`.
//!
//! `TableError` is what the user-facing [`crate::table::LogTable`] returns. It
//! keeps "the path does not exist" apart from "the path exists but holds no
//! table", and wraps log and configuration failures with their sources.

use snafu::prelude::*;

use crate::config::ConfigError;
use crate::transaction_log::CommitError;

/// Errors from table-level operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// The table root directory does not exist.
    #[snafu(display("Table root does not exist: {path}"))]
    TableRootMissing {
        /// The missing root.
        path: String,
    },

    /// The root exists but holds no log, or the log has no valid protocol and
    /// metadata.
    #[snafu(display("Not a table: {path}: {msg}"))]
    NotATable {
        /// The table root.
        path: String,
        /// What is missing.
        msg: String,
    },

    /// Attempt to create a table where commits already exist.
    #[snafu(display("Table already exists; current transaction log version is {current_version}"))]
    AlreadyExists {
        /// Latest committed version of the existing table.
        current_version: u64,
    },

    /// Any error coming from the transaction log / commit machinery
    /// (for example, OCC conflicts, storage failures, or corrupt commits).
    #[snafu(display("Transaction log error: {source}"))]
    TransactionLog {
        /// Underlying transaction log / commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// A table property carries a malformed value.
    #[snafu(display("Invalid table configuration: {source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },
}

impl TableError {
    /// True for the terminal optimistic-concurrency failure.
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, TableError::TransactionLog { source } if source.is_concurrent_modification())
    }
}
