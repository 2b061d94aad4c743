//! Checkpoints: full-state serializations that bound replay cost.
//!
//! A checkpoint at version `V` holds the actions of the snapshot at `V`
//! (protocol, metadata, one add per active file) as NDJSON, either in a single
//! `<V>.checkpoint.json` file or split across numbered parts. The newest
//! checkpoint is advertised in `_delta_log/_last_checkpoint`.
//!
//! Checkpoints are advisory. Readers use them to skip replay and fall back to
//! older checkpoints or to full replay when one cannot be read; nothing about
//! the correctness of a version depends on a checkpoint existing. Writing a
//! checkpoint is idempotent: rewriting a version with identical content
//! leaves the files untouched, and `_last_checkpoint` never moves backwards.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::config::LogConfig;
use crate::storage::{self, layout, layout::LogFileKind};
use crate::transaction_log::actions::{self, Action};
use crate::transaction_log::snapshot::{Snapshot, SnapshotCache};
use crate::transaction_log::{CommitError, LogFile, StorageSnafu, TransactionLogStore};

/// Pointer to a checkpoint, as stored in `_last_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Version the checkpoint materializes.
    pub version: u64,
    /// Number of actions in the checkpoint.
    pub size: u64,
    /// Number of parts, for multi-part checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
}

/// A checkpoint found in a directory listing, with every file it consists of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    /// Version the checkpoint materializes.
    pub version: u64,
    /// Number of parts, for multi-part checkpoints.
    pub parts: Option<u32>,
    /// The checkpoint's files, in part order.
    pub files: Vec<LogFile>,
}

impl CheckpointFiles {
    /// Modification time of the most recently written file.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.files.iter().map(|f| f.meta.modified).max()
    }
}

/// Group checkpoint files into complete checkpoints, ordered by version.
///
/// A multi-part checkpoint is complete only when every part is present.
pub(crate) fn complete_checkpoints(files: &[LogFile]) -> Vec<CheckpointFiles> {
    let mut groups: BTreeMap<(u64, Option<u32>), Vec<LogFile>> = BTreeMap::new();
    for file in files {
        match file.kind {
            LogFileKind::Checkpoint(version) => {
                groups.entry((version, None)).or_default().push(file.clone());
            }
            LogFileKind::CheckpointPart { version, parts, .. } => {
                groups
                    .entry((version, Some(parts)))
                    .or_default()
                    .push(file.clone());
            }
            LogFileKind::Commit(_) => {}
        }
    }

    groups
        .into_iter()
        .filter_map(|((version, parts), mut files)| {
            if let Some(n) = parts {
                let present: BTreeSet<u32> = files
                    .iter()
                    .filter_map(|f| match f.kind {
                        LogFileKind::CheckpointPart { part, .. } => Some(part),
                        _ => None,
                    })
                    .collect();
                if present.len() != n as usize {
                    log::debug!(
                        "ignoring incomplete checkpoint at version {version} ({}/{n} parts)",
                        present.len()
                    );
                    return None;
                }
            }
            files.sort_by(|a, b| a.kind.cmp(&b.kind));
            Some(CheckpointFiles {
                version,
                parts,
                files,
            })
        })
        .collect()
}

impl TransactionLogStore {
    /// Read `_last_checkpoint`.
    ///
    /// A missing pointer is `None`; so is an unparseable one, since the
    /// pointer is only a hint.
    pub async fn read_last_checkpoint(&self) -> Result<Option<CheckpointInfo>, CommitError> {
        let rel = layout::last_checkpoint_rel_path();
        let text = match storage::read_to_string(self.location().as_ref(), &rel).await {
            Ok(text) => text,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        match serde_json::from_str::<CheckpointInfo>(&text) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                log::warn!("ignoring unreadable {}: {e}", rel.display());
                Ok(None)
            }
        }
    }

    /// List complete checkpoints, oldest first.
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointFiles>, CommitError> {
        let files = self.list_log_files().await?;
        Ok(complete_checkpoints(&files))
    }

    /// Read the actions of the checkpoint at `version`, parts concatenated.
    pub async fn read_checkpoint(
        &self,
        version: u64,
        parts: Option<u32>,
    ) -> Result<Vec<Action>, CommitError> {
        let mut out = Vec::new();
        for rel in layout::checkpoint_rel_paths(version, parts) {
            let text = storage::read_to_string(self.location().as_ref(), &rel)
                .await
                .context(StorageSnafu)?;
            let actions = actions::decode_actions(&text).map_err(|e| CommitError::CorruptState {
                msg: format!("failed to parse checkpoint {}: {e}", rel.display()),
                backtrace: Backtrace::capture(),
            })?;
            out.extend(actions);
        }
        Ok(out)
    }

    /// Load the newest readable checkpoint at or below `version` that is newer
    /// than `newer_than`.
    ///
    /// Tries the `_last_checkpoint` hint first, then the directory listing.
    /// Unreadable checkpoints are skipped with a warning.
    pub(crate) async fn load_checkpoint_at_or_before(
        &self,
        version: u64,
        newer_than: Option<u64>,
    ) -> Result<Option<(u64, Vec<Action>)>, CommitError> {
        let useful = |cp_version: u64| {
            cp_version <= version && newer_than.is_none_or(|floor| cp_version > floor)
        };

        let mut tried = None;
        if let Some(hint) = self.read_last_checkpoint().await? {
            if useful(hint.version) {
                match self.read_checkpoint(hint.version, hint.parts).await {
                    Ok(actions) => return Ok(Some((hint.version, actions))),
                    Err(e) => {
                        log::warn!("checkpoint {} is unreadable, listing log: {e}", hint.version);
                        tried = Some((hint.version, hint.parts));
                    }
                }
            }
        }

        for cp in self.list_checkpoints().await?.into_iter().rev() {
            if !useful(cp.version) {
                if cp.version <= version {
                    break;
                }
                continue;
            }
            if tried == Some((cp.version, cp.parts)) {
                continue;
            }
            match self.read_checkpoint(cp.version, cp.parts).await {
                Ok(actions) => return Ok(Some((cp.version, actions))),
                Err(e) => log::warn!("skipping unreadable checkpoint {}: {e}", cp.version),
            }
        }
        Ok(None)
    }

    /// Write a checkpoint for `snapshot`.
    ///
    /// With `part_size = Some(n)` and more than `n` actions, the checkpoint is
    /// split into parts of at most `n` actions. Files whose content would not
    /// change are not rewritten. `_last_checkpoint` is advanced unless it
    /// already points at a newer version.
    pub async fn write_checkpoint(
        &self,
        snapshot: &Snapshot,
        part_size: Option<usize>,
    ) -> Result<CheckpointInfo, CommitError> {
        let version = snapshot.version();
        let actions = snapshot.checkpoint_actions();

        let chunks: Vec<&[Action]> = match part_size {
            Some(n) if n > 0 && actions.len() > n => actions.chunks(n).collect(),
            _ => vec![actions.as_slice()],
        };
        let parts = if chunks.len() > 1 {
            let n = u32::try_from(chunks.len()).map_err(|_| CommitError::CorruptState {
                msg: format!("checkpoint {version} needs too many parts ({})", chunks.len()),
                backtrace: Backtrace::capture(),
            })?;
            Some(n)
        } else {
            None
        };

        let location = self.location().as_ref();
        let paths = layout::checkpoint_rel_paths(version, parts);
        let mut written = 0usize;
        for (rel, chunk) in paths.iter().zip(chunks) {
            let bytes = actions::encode_actions(chunk).map_err(|e| CommitError::CorruptState {
                msg: format!("failed to serialize checkpoint {version}: {e}"),
                backtrace: Backtrace::capture(),
            })?;

            match storage::read_to_string(location, rel).await {
                Ok(existing) if existing.as_bytes() == bytes.as_slice() => continue,
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => return Err(CommitError::Storage { source }),
            }

            storage::write_atomic(location, rel, &bytes)
                .await
                .context(StorageSnafu)?;
            written += 1;
        }

        let info = CheckpointInfo {
            version,
            size: actions.len() as u64,
            parts,
        };
        self.advance_last_checkpoint(&info).await?;

        if written == 0 {
            log::debug!("checkpoint at version {version} already up to date");
        } else {
            log::info!(
                "wrote checkpoint at version {version} ({} actions, {} file(s))",
                info.size,
                paths.len()
            );
        }
        Ok(info)
    }

    async fn advance_last_checkpoint(&self, info: &CheckpointInfo) -> Result<(), CommitError> {
        match self.read_last_checkpoint().await? {
            Some(current) if current.version > info.version => return Ok(()),
            Some(current) if current == *info => return Ok(()),
            _ => {}
        }

        let bytes = serde_json::to_vec(info).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize _last_checkpoint: {e}"),
            backtrace: Backtrace::capture(),
        })?;
        storage::write_atomic(
            self.location().as_ref(),
            &layout::last_checkpoint_rel_path(),
            &bytes,
        )
        .await
        .context(StorageSnafu)
    }

    /// Build the snapshot at `version` and write it as a checkpoint.
    pub async fn checkpoint_at(
        &self,
        version: u64,
        part_size: Option<usize>,
    ) -> Result<CheckpointInfo, CommitError> {
        let snapshot = self.snapshot_at(version).await?;
        self.write_checkpoint(&snapshot, part_size).await
    }

    /// Checkpoint `version` if the configured interval says one is due.
    pub(crate) async fn maybe_checkpoint(
        &self,
        version: u64,
        config: &LogConfig,
        cache: &SnapshotCache,
    ) -> Result<Option<CheckpointInfo>, CommitError> {
        if !config.checkpoint_due(version) {
            return Ok(None);
        }
        let snapshot: Arc<Snapshot> = self.cached_snapshot(Some(version), cache).await?;
        let info = self
            .write_checkpoint(&snapshot, config.checkpoint_part_size)
            .await?;
        Ok(Some(info))
    }
}
