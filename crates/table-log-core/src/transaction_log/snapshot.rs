//! Snapshot reconstruction.
//!
//! A [`Snapshot`] is the materialized table state at one version: the protocol,
//! the metadata and the set of active data files. It is built by starting
//! from the newest usable base at or below the target version and replaying
//! the commits after it, in version order and, within a commit, in file order:
//!
//! - `add` inserts or replaces the entry for its path;
//! - `remove` deletes the entry for its path (removing an absent path is a
//!   no-op);
//! - `metaData` and `protocol` replace the current value.
//!
//! The base is the newer of the closest cached snapshot and the newest readable
//! checkpoint, or the empty state before version 0 when there is neither. Snapshots are immutable
//! once built and shared as `Arc<Snapshot>`.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::prelude::*;

use crate::storage::layout::LogFileKind;
use crate::transaction_log::checkpoint::complete_checkpoints;
use crate::transaction_log::{
    Action, AddFile, CommitError, Metadata, NotATableSnafu, Protocol, TransactionLogStore,
    VersionNotFoundSnafu, VersionNotReproducibleSnafu, check_reader_protocol,
};

/// Materialized table state at a specific version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    version: u64,
    protocol: Protocol,
    metadata: Metadata,
    files: BTreeMap<String, AddFile>,
}

impl Snapshot {
    /// Version this snapshot materializes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Protocol in effect at this version.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Table metadata in effect at this version.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Active data files keyed by path.
    pub fn files(&self) -> &BTreeMap<String, AddFile> {
        &self.files
    }

    /// Paths of the active data files, in sorted order.
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of active data files.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Sum of the sizes of the active data files, in bytes.
    pub fn total_size(&self) -> i64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Partition columns of the table.
    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// Table properties (`metaData.configuration`).
    pub fn table_properties(&self) -> &BTreeMap<String, String> {
        &self.metadata.configuration
    }

    /// The full state as actions: protocol, metadata, then one add per file
    /// in path order. This is the content of a checkpoint.
    pub fn checkpoint_actions(&self) -> Vec<Action> {
        let mut actions = Vec::with_capacity(self.files.len() + 2);
        actions.push(Action::Protocol(self.protocol));
        actions.push(Action::Metadata(self.metadata.clone()));
        actions.extend(self.files.values().cloned().map(Action::Add));
        actions
    }
}

/// Mutable accumulator used while replaying actions.
#[derive(Debug, Default)]
struct ReplayState {
    protocol: Option<Protocol>,
    metadata: Option<Metadata>,
    files: BTreeMap<String, AddFile>,
}

impl ReplayState {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            protocol: Some(snapshot.protocol),
            metadata: Some(snapshot.metadata.clone()),
            files: snapshot.files.clone(),
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Add(add) => {
                self.files.insert(add.path.clone(), add);
            }
            Action::Remove(remove) => {
                self.files.remove(&remove.path);
            }
            Action::Metadata(metadata) => self.metadata = Some(metadata),
            Action::Protocol(protocol) => self.protocol = Some(protocol),
            Action::CommitInfo(_) => {}
        }
    }

    fn apply_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.apply(action);
        }
    }

    fn finish(self, version: u64) -> Result<Snapshot, CommitError> {
        let protocol = self.protocol.context(NotATableSnafu {
            msg: format!("no protocol action at or before version {version}"),
        })?;
        let metadata = self.metadata.context(NotATableSnafu {
            msg: format!("no metaData action at or before version {version}"),
        })?;
        check_reader_protocol(&protocol)?;

        Ok(Snapshot {
            version,
            protocol,
            metadata,
            files: self.files,
        })
    }
}

/// Bounded cache of built snapshots, shared by clones of a table handle.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotCache {
    capacity: usize,
    entries: Arc<Mutex<BTreeMap<u64, Arc<Snapshot>>>>,
}

impl SnapshotCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub(crate) fn get(&self, version: u64) -> Option<Arc<Snapshot>> {
        self.entries.lock().get(&version).cloned()
    }

    /// Newest cached snapshot at or below `version`.
    pub(crate) fn latest_at_or_before(&self, version: u64) -> Option<Arc<Snapshot>> {
        self.entries
            .lock()
            .range(..=version)
            .next_back()
            .map(|(_, s)| Arc::clone(s))
    }

    /// Insert a snapshot, evicting the oldest versions beyond capacity.
    pub(crate) fn insert(&self, snapshot: Arc<Snapshot>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.insert(snapshot.version(), snapshot);
        while entries.len() > self.capacity {
            entries.pop_first();
        }
    }

    #[cfg(test)]
    fn versions(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }
}

impl TransactionLogStore {
    /// Build the snapshot at `version`.
    ///
    /// # Errors
    /// - [`CommitError::NotATable`] if the log is empty or carries no
    ///   protocol/metadata.
    /// - [`CommitError::VersionNotFound`] if `version` is newer than the log.
    /// - [`CommitError::VersionNotReproducible`] if a commit needed for the
    ///   replay was removed and no checkpoint covers it.
    pub async fn snapshot_at(&self, version: u64) -> Result<Snapshot, CommitError> {
        let snapshot = self.build_snapshot(Some(version), None).await?;
        Ok(Arc::unwrap_or_clone(snapshot))
    }

    /// Build the snapshot at the latest committed version.
    pub async fn latest_snapshot(&self) -> Result<Snapshot, CommitError> {
        let snapshot = self.build_snapshot(None, None).await?;
        Ok(Arc::unwrap_or_clone(snapshot))
    }

    /// Build (or fetch) a snapshot through `cache`; `None` means latest.
    pub(crate) async fn cached_snapshot(
        &self,
        version: Option<u64>,
        cache: &SnapshotCache,
    ) -> Result<Arc<Snapshot>, CommitError> {
        self.build_snapshot(version, Some(cache)).await
    }

    async fn build_snapshot(
        &self,
        version: Option<u64>,
        cache: Option<&SnapshotCache>,
    ) -> Result<Arc<Snapshot>, CommitError> {
        let latest = self.latest_version().await?.context(NotATableSnafu {
            msg: "no commits found in _delta_log",
        })?;
        let target = version.unwrap_or(latest);
        ensure!(
            target <= latest,
            VersionNotFoundSnafu {
                version: target,
                latest: Some(latest),
            }
        );

        if let Some(hit) = cache.and_then(|c| c.get(target)) {
            log::debug!("snapshot cache hit for version {target}");
            return Ok(hit);
        }

        let cached_base = cache.and_then(|c| c.latest_at_or_before(target));
        let cached_version = cached_base.as_ref().map(|s| s.version());

        let (mut state, first) = match self
            .load_checkpoint_at_or_before(target, cached_version)
            .await?
        {
            Some((cp_version, actions)) => {
                log::debug!("replaying version {target} from checkpoint {cp_version}");
                let mut state = ReplayState::default();
                state.apply_all(actions);
                (state, cp_version + 1)
            }
            None => match cached_base {
                Some(base) => {
                    log::debug!(
                        "replaying version {target} from cached snapshot {}",
                        base.version()
                    );
                    (ReplayState::from_snapshot(&base), base.version() + 1)
                }
                None => {
                    log::debug!("replaying version {target} from version 0");
                    (ReplayState::default(), 0)
                }
            },
        };

        for v in first..=target {
            let actions = match self.read_commit(v).await {
                Ok(actions) => actions,
                Err(e) if e.is_not_found() => {
                    let earliest = self.earliest_reproducible_version().await?;
                    return VersionNotReproducibleSnafu {
                        version: target,
                        earliest,
                    }
                    .fail();
                }
                Err(e) => return Err(e),
            };
            state.apply_all(actions);
        }

        let snapshot = Arc::new(state.finish(target)?);
        if let Some(cache) = cache {
            cache.insert(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    /// Earliest version whose state can still be rebuilt, if any.
    ///
    /// A version is reproducible when it can be reached from version 0 or from
    /// a complete checkpoint through commit files that are all present.
    pub async fn earliest_reproducible_version(&self) -> Result<Option<u64>, CommitError> {
        let files = self.list_log_files().await?;
        let commits: BTreeSet<u64> = files
            .iter()
            .filter_map(|f| match f.kind {
                LogFileKind::Commit(v) => Some(v),
                _ => None,
            })
            .collect();

        let Some(&latest) = commits.last() else {
            return Ok(None);
        };

        // Lowest version of the unbroken run of commits ending at `latest`.
        let mut low = latest;
        while low > 0 && commits.contains(&(low - 1)) {
            low -= 1;
        }
        if low == 0 {
            return Ok(Some(0));
        }

        let earliest_checkpoint = complete_checkpoints(&files)
            .into_iter()
            .map(|cp| cp.version)
            .find(|v| *v + 1 >= low && *v <= latest);
        Ok(earliest_checkpoint)
    }
}
