//! On-disk layout helpers for a table root.
//!
//! This module centralizes all *relative* path conventions under a table root:
//! - the transaction log directory (`_delta_log/`),
//! - commit file naming (`_delta_log/<20-digit version>.json`),
//! - checkpoint file naming, single-file and multi-part,
//! - the `_last_checkpoint` pointer.
//!
//! The functions here return relative [`std::path::PathBuf`] values. Callers are
//! expected to join these with a table root (for example a
//! [`crate::storage::TableLocation`]) before doing IO.
//!
//! File names are zero padded so that a lexicographic listing of the log
//! directory is also a listing in version order.

use std::path::PathBuf;

/// Name of the subdirectory containing the commit log.
pub const LOG_DIR_NAME: &str = "_delta_log";

/// Name of the advisory pointer to the newest checkpoint.
pub const LAST_CHECKPOINT_FILE_NAME: &str = "_last_checkpoint";

/// Number of digits used in zero-padded commit and checkpoint file names.
pub const VERSION_FILENAME_DIGITS: usize = 20;

/// Number of digits used for the part counters of multi-part checkpoints.
pub const PART_FILENAME_DIGITS: usize = 10;

const COMMIT_EXT: &str = "json";
const CHECKPOINT_INFIX: &str = "checkpoint";

/// Relative path: `_delta_log/`
pub fn log_rel_dir() -> PathBuf {
    PathBuf::from(LOG_DIR_NAME)
}

/// Relative path: `_delta_log/_last_checkpoint`
pub fn last_checkpoint_rel_path() -> PathBuf {
    log_rel_dir().join(LAST_CHECKPOINT_FILE_NAME)
}

/// File name of the commit for `version`, e.g. `00000000000000000007.json`.
pub fn commit_file_name(version: u64) -> String {
    format!(
        "{:0width$}.{COMMIT_EXT}",
        version,
        width = VERSION_FILENAME_DIGITS
    )
}

/// Relative path: `_delta_log/<zero-padded>.json`
pub fn commit_rel_path(version: u64) -> PathBuf {
    log_rel_dir().join(commit_file_name(version))
}

/// Relative path: `_delta_log/<zero-padded>.checkpoint.json`
pub fn checkpoint_rel_path(version: u64) -> PathBuf {
    log_rel_dir().join(format!(
        "{:0width$}.{CHECKPOINT_INFIX}.{COMMIT_EXT}",
        version,
        width = VERSION_FILENAME_DIGITS
    ))
}

/// Relative path of one part of a multi-part checkpoint.
///
/// `part` is 1-based: `_delta_log/<version>.checkpoint.<part>.<parts>.json`.
pub fn checkpoint_part_rel_path(version: u64, part: u32, parts: u32) -> PathBuf {
    log_rel_dir().join(format!(
        "{:0vw$}.{CHECKPOINT_INFIX}.{:0pw$}.{:0pw$}.{COMMIT_EXT}",
        version,
        part,
        parts,
        vw = VERSION_FILENAME_DIGITS,
        pw = PART_FILENAME_DIGITS
    ))
}

/// Relative paths of every file making up a checkpoint.
///
/// `parts == None` is the single-file layout.
pub fn checkpoint_rel_paths(version: u64, parts: Option<u32>) -> Vec<PathBuf> {
    match parts {
        None => vec![checkpoint_rel_path(version)],
        Some(n) => (1..=n)
            .map(|part| checkpoint_part_rel_path(version, part, n))
            .collect(),
    }
}

/// A file name inside `_delta_log/` that belongs to the log protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogFileKind {
    /// A commit file for the given version.
    Commit(u64),
    /// A single-file checkpoint.
    Checkpoint(u64),
    /// One part of a multi-part checkpoint.
    CheckpointPart {
        /// Version the checkpoint materializes.
        version: u64,
        /// 1-based index of this part.
        part: u32,
        /// Total number of parts.
        parts: u32,
    },
}

impl LogFileKind {
    /// Version the file belongs to.
    pub fn version(&self) -> u64 {
        match self {
            LogFileKind::Commit(v) | LogFileKind::Checkpoint(v) => *v,
            LogFileKind::CheckpointPart { version, .. } => *version,
        }
    }

    /// Parse a bare file name (no directory).
    ///
    /// Returns `None` for names that are not part of the log protocol, such as
    /// `_last_checkpoint`, temporary files or anything foreign.
    pub fn parse(file_name: &str) -> Option<Self> {
        if file_name.starts_with('.') {
            return None;
        }
        let stem = file_name.strip_suffix(".json")?;
        let mut pieces = stem.split('.');

        let version = parse_digits(pieces.next()?, VERSION_FILENAME_DIGITS)?;

        match (pieces.next(), pieces.next(), pieces.next(), pieces.next()) {
            (None, ..) => Some(LogFileKind::Commit(version)),
            (Some(CHECKPOINT_INFIX), None, ..) => Some(LogFileKind::Checkpoint(version)),
            (Some(CHECKPOINT_INFIX), Some(part), Some(parts), None) => {
                let part = u32::try_from(parse_digits(part, PART_FILENAME_DIGITS)?).ok()?;
                let parts = u32::try_from(parse_digits(parts, PART_FILENAME_DIGITS)?).ok()?;
                if part == 0 || part > parts {
                    return None;
                }
                Some(LogFileKind::CheckpointPart {
                    version,
                    part,
                    parts,
                })
            }
            _ => None,
        }
    }
}

fn parse_digits(s: &str, width: usize) -> Option<u64> {
    if s.len() != width || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_names_sort_in_version_order() {
        let mut names: Vec<String> = [10u64, 2, 100, 1]
            .iter()
            .map(|v| commit_file_name(*v))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                commit_file_name(1),
                commit_file_name(2),
                commit_file_name(10),
                commit_file_name(100)
            ]
        );
        assert_eq!(commit_file_name(7), "00000000000000000007.json");
    }

    #[test]
    fn parse_recognizes_protocol_files() {
        assert_eq!(
            LogFileKind::parse("00000000000000000003.json"),
            Some(LogFileKind::Commit(3))
        );
        assert_eq!(
            LogFileKind::parse("00000000000000000010.checkpoint.json"),
            Some(LogFileKind::Checkpoint(10))
        );
        assert_eq!(
            LogFileKind::parse("00000000000000000010.checkpoint.0000000002.0000000003.json"),
            Some(LogFileKind::CheckpointPart {
                version: 10,
                part: 2,
                parts: 3
            })
        );
    }

    #[test]
    fn parse_ignores_foreign_names() {
        for name in [
            "_last_checkpoint",
            ".00000000000000000003.json.6f1c.tmp",
            "3.json",
            "00000000000000000003.crc",
            "00000000000000000010.checkpoint.0000000004.0000000003.json",
            "00000000000000000010.checkpoint.parquet",
        ] {
            assert_eq!(LogFileKind::parse(name), None, "{name}");
        }
    }

    #[test]
    fn part_paths_round_trip_through_parse() {
        let paths = checkpoint_rel_paths(20, Some(2));
        assert_eq!(paths.len(), 2);
        let name = paths[1]
            .file_name()
            .and_then(|n| n.to_str())
            .expect("utf-8 file name");
        assert_eq!(
            LogFileKind::parse(name),
            Some(LogFileKind::CheckpointPart {
                version: 20,
                part: 2,
                parts: 2
            })
        );
    }
}
