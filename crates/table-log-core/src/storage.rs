//! Filesystem layout and storage primitives.
//!
//! This module centralizes all filesystem-related logic for
//! `table-log-core`. It maps a table root to concrete files and provides the
//! small set of primitives the log protocol is built on:
//!
//! - [`write_new`]: atomic *create-if-absent* of a complete file. This is the
//!   only mutual exclusion the commit protocol relies on; it must hold across
//!   processes and machines, so it is expressed through the filesystem and
//!   never through an in-process lock.
//! - [`write_atomic`]: atomic replace (write-then-rename) for advisory files
//!   such as `_last_checkpoint` and checkpoints.
//! - [`read_to_string`], [`stat`], [`list_dir`] and [`delete_if_exists`] for
//!   readers, checkpoint discovery and retention.
//!
//! Only the local filesystem backend exists, but callers go through
//! [`StorageLocation`] so that other backends can be introduced without
//! rewriting the log and table logic.

mod error;
pub mod layout;
mod table_location;

pub use error::{BackendError, StorageError};
pub(crate) use error::{InvalidLocationSnafu, NotFoundSnafu, OtherIoSnafu};
pub use table_location::TableLocation;

use chrono::{DateTime, Utc};
use snafu::{Backtrace, prelude::*};
use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Represents where a storage root lives.
///
/// Abstracts over storage backends; only the local filesystem is supported
/// today.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A root directory on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// Parse a user-facing location string.
    ///
    /// Accepts plain paths and `file://` URLs.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        let trimmed = spec.trim();
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        ensure!(
            !path.is_empty(),
            InvalidLocationSnafu {
                location: spec.to_string(),
            }
        );
        Ok(StorageLocation::Local(PathBuf::from(path)))
    }
}

/// Size and modification time of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Length of the file in bytes.
    pub size: u64,
    /// Last modification time as reported by the backend.
    pub modified: DateTime<Utc>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryMeta {
    /// Bare file name.
    pub name: String,
    /// Size and modification time.
    pub meta: FileMeta,
}

/// Join a storage location with a relative path into an absolute local path.
pub(crate) fn join_local(location: &StorageLocation, rel: &Path) -> PathBuf {
    match location {
        StorageLocation::Local(root) => root.join(rel),
    }
}

fn other_io(path: &Path, e: io::Error) -> StorageError {
    StorageError::OtherIo {
        path: path.display().to_string(),
        source: BackendError::Local(e),
        backtrace: Backtrace::capture(),
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

fn file_meta(meta: &std::fs::Metadata) -> FileMeta {
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    FileMeta {
        size: meta.len(),
        modified: DateTime::<Utc>::from(modified),
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort; we are usually already unwinding another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Hidden, unique sibling used as the staging file for `abs`.
///
/// The leading dot keeps it out of every log listing.
fn temp_sibling(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Write `contents` to a fresh staging file next to `abs` and fsync it.
async fn write_staged(abs: &Path, contents: &[u8]) -> StorageResult<TempFileGuard> {
    create_parent_dir(abs).await?;

    let tmp_path = temp_sibling(abs);
    let guard = TempFileGuard::new(tmp_path.clone());

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .await
        .map_err(|e| other_io(&tmp_path, e))?;

    file.write_all(contents)
        .await
        .map_err(|e| other_io(&tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| other_io(&tmp_path, e))?;

    Ok(guard)
}

/// Write `contents` to `rel_path` inside `location`, replacing any existing
/// file atomically.
///
/// Performs write-to-temp, fsync, rename. Readers observe either the old or the
/// new content, never a mix.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let mut guard = write_staged(&abs, contents).await?;

            fs::rename(&guard.path, &abs)
                .await
                .map_err(|e| other_io(&abs, e))?;

            // Renamed into place; nothing left to clean up.
            guard.disarm();
            Ok(())
        }
    }
}

/// Create a *new* file at `rel_path` holding `contents`, failing with
/// [`StorageError::AlreadyExists`] if the name is taken.
///
/// The content is staged in a hidden temp file and then hard-linked to the
/// target name. `link(2)` fails if the target exists, so two writers racing for
/// the same name get exactly one winner, and the target never becomes visible
/// with partial content.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let staged = write_staged(&abs, contents).await?;

            fs::hard_link(&staged.path, &abs)
                .await
                .map_err(|e| classify(&abs, e))?;

            // `staged` is dropped here, unlinking the temp name.
            drop(staged);
            Ok(())
        }
    }
}

/// Read the file at `rel_path` and return its contents as a `String`.
///
/// A missing file is reported as [`StorageError::NotFound`].
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read_to_string(&abs)
                .await
                .map_err(|e| classify(&abs, e))
        }
    }
}

/// Size and modification time of the file at `rel_path`.
///
/// Directories and other non-regular files are reported as `NotFound`.
pub async fn stat(location: &StorageLocation, rel_path: &Path) -> StorageResult<FileMeta> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let meta = fs::metadata(&abs).await.map_err(|e| classify(&abs, e))?;

            if !meta.is_file() {
                return Err(BackendError::Local(io::Error::other("not a regular file")))
                    .context(NotFoundSnafu {
                        path: abs.display().to_string(),
                    });
            }
            Ok(file_meta(&meta))
        }
    }
}

/// Whether `rel_path` exists and is a directory.
pub async fn dir_exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::metadata(&abs).await {
                Ok(meta) => Ok(meta.is_dir()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(other_io(&abs, e)),
            }
        }
    }
}

/// List regular files directly under `rel_dir`.
///
/// A missing directory yields an empty listing. The result is sorted by name.
pub async fn list_dir(
    location: &StorageLocation,
    rel_dir: &Path,
) -> StorageResult<Vec<DirEntryMeta>> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_dir);
            let mut rd = match fs::read_dir(&abs).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(other_io(&abs, e)),
            };

            let mut out = Vec::new();
            while let Some(entry) = rd.next_entry().await.map_err(|e| other_io(&abs, e))? {
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    // Raced with a concurrent delete.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(other_io(&entry.path(), e)),
                };
                if !meta.is_file() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                out.push(DirEntryMeta {
                    name,
                    meta: file_meta(&meta),
                });
            }
            out.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(out)
        }
    }
}

/// Delete the file at `rel_path`.
///
/// Returns `false` if it was already gone.
pub async fn delete_if_exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::remove_file(&abs).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(other_io(&abs, e)),
            }
        }
    }
}
