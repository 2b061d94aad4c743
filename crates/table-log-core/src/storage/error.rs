//! Failures of the file layer under a table root.
//!
//! Every variant names the log file or directory it concerns, so a failed
//! commit write or checkpoint read can be traced to a concrete file.

use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Raw failure reported by the filesystem holding the table.
#[derive(Debug)]
pub enum BackendError {
    /// Local filesystem failure.
    Local(io::Error),
}

impl BackendError {
    /// The I/O error kind behind this failure.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            BackendError::Local(e) => e.kind(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "filesystem: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors from reading, writing, listing or deleting log files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The location string does not name a usable table root.
    #[snafu(display("Unusable table location '{location}'"))]
    InvalidLocation {
        /// The location as given.
        location: String,
        /// Where the location was rejected.
        backtrace: Backtrace,
    },

    /// A commit, checkpoint or log directory is absent. Readers treat this as
    /// "not written yet" or "removed by retention".
    #[snafu(display("No such log file or directory: {path}"))]
    NotFound {
        /// Absolute path that was looked up.
        path: String,
        /// Filesystem error behind the lookup.
        source: BackendError,
        /// Where the lookup failed.
        backtrace: Backtrace,
    },

    /// A create-exclusive write found its target taken, typically a commit
    /// version claimed by a concurrent writer.
    #[snafu(display("Log file {path} was already written by another writer"))]
    AlreadyExists {
        /// Absolute path of the taken file.
        path: String,
        /// Filesystem error reporting the collision.
        source: BackendError,
        /// Where the collision was detected.
        backtrace: Backtrace,
    },

    /// The file exists (or should be creatable) but could not be read,
    /// written or removed, including contents that are not UTF-8.
    #[snafu(display("I/O failure on {path}: {source}"))]
    OtherIo {
        /// Absolute path of the file or directory involved.
        path: String,
        /// Filesystem error.
        source: BackendError,
        /// Where the failure surfaced.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// True when the target file or directory does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// True when a create-exclusive write lost to an existing file.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists { .. })
    }

    /// Path of the file involved, if the error concerns one.
    pub fn path(&self) -> Option<&str> {
        match self {
            StorageError::InvalidLocation { .. } => None,
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => Some(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_and_absence_are_told_apart() {
        let taken = StorageError::AlreadyExists {
            path: "/t/_delta_log/00000000000000000003.json".to_string(),
            source: BackendError::Local(io::Error::from(io::ErrorKind::AlreadyExists)),
            backtrace: Backtrace::capture(),
        };
        assert!(taken.is_already_exists());
        assert!(!taken.is_not_found());
        assert_eq!(taken.path(), Some("/t/_delta_log/00000000000000000003.json"));

        let garbled = StorageError::OtherIo {
            path: "/t/_delta_log/00000000000000000004.json".to_string(),
            source: BackendError::Local(io::Error::from(io::ErrorKind::InvalidData)),
            backtrace: Backtrace::capture(),
        };
        assert!(!garbled.is_not_found());
        assert!(garbled.to_string().starts_with("I/O failure on"));
        assert!(matches!(
            garbled,
            StorageError::OtherIo { ref source, .. } if source.kind() == io::ErrorKind::InvalidData
        ));
    }
}
