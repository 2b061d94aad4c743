//! Table layer.
//!
//! [`LogTable`] is the user-facing handle over a table root: it opens or
//! creates tables, starts transactions, and exposes snapshots, history,
//! checkpoints and log cleanup. A handle owns its configuration and its
//! snapshot cache; clones share the cache. There is no process-wide state, so
//! any number of tables (and tests) can be used side by side.

pub mod error;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::config::{CalendarInterval, LogConfig};
use crate::storage::{self, TableLocation};
use crate::transaction_log::snapshot::SnapshotCache;
use crate::transaction_log::{
    Action, CheckpointInfo, CleanupPlan, CleanupReport, CommitError, HistoryEntry, Metadata,
    Operation, Protocol, SaveMode, Snapshot, Transaction, TransactionLogStore,
};

pub use error::TableError;
use error::{ConfigSnafu, TransactionLogSnafu};

/// Handle to a table backed by a transaction log.
#[derive(Debug, Clone)]
pub struct LogTable {
    store: TransactionLogStore,
    config: LogConfig,
    cache: SnapshotCache,
}

impl LogTable {
    /// A handle for `location` with default configuration. Does no IO.
    pub fn for_location(location: TableLocation) -> Self {
        let config = LogConfig::default();
        Self {
            store: TransactionLogStore::new(location),
            cache: SnapshotCache::new(config.snapshot_cache_capacity),
            config,
        }
    }

    /// Replace the handle's configuration. The snapshot cache starts empty.
    #[must_use]
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.cache = SnapshotCache::new(config.snapshot_cache_capacity);
        self.config = config;
        self
    }

    /// Open an existing table with default configuration.
    pub async fn open(location: TableLocation) -> Result<Self, TableError> {
        Self::open_with_config(location, LogConfig::default()).await
    }

    /// Open an existing table.
    ///
    /// # Errors
    /// - [`TableError::TableRootMissing`] if the root directory does not exist.
    /// - [`TableError::NotATable`] if the root has no log, or the log carries
    ///   no valid protocol and metadata.
    pub async fn open_with_config(
        location: TableLocation,
        config: LogConfig,
    ) -> Result<Self, TableError> {
        let table = Self::for_location(location).with_config(config);
        let path = table.location().to_string();

        let root_exists = storage::dir_exists(table.location().as_ref(), Path::new(""))
            .await
            .map_err(|source| CommitError::Storage { source })
            .context(TransactionLogSnafu)?;
        ensure!(root_exists, error::TableRootMissingSnafu { path });

        let has_log = table
            .store
            .log_dir_exists()
            .await
            .context(TransactionLogSnafu)?;
        ensure!(
            has_log,
            error::NotATableSnafu {
                path,
                msg: "no _delta_log directory",
            }
        );

        let snapshot = match table.store.cached_snapshot(None, &table.cache).await {
            Ok(snapshot) => snapshot,
            Err(CommitError::NotATable { msg }) => {
                return error::NotATableSnafu { path, msg }.fail();
            }
            Err(source) => return Err(TableError::TransactionLog { source }),
        };
        table
            .config
            .with_table_properties(snapshot.table_properties())
            .context(ConfigSnafu)?;

        log::debug!("opened table {path} at version {}", snapshot.version());
        Ok(table)
    }

    /// Create a table with default configuration.
    pub async fn create(location: TableLocation, metadata: Metadata) -> Result<Self, TableError> {
        Self::create_with_config(location, metadata, LogConfig::default()).await
    }

    /// Create a table: commit version 0 with the default protocol and
    /// `metadata`.
    ///
    /// # Errors
    /// - [`TableError::AlreadyExists`] if the log already has commits.
    /// - [`TableError::Config`] if `metadata.configuration` holds malformed
    ///   recognized properties.
    pub async fn create_with_config(
        location: TableLocation,
        metadata: Metadata,
        config: LogConfig,
    ) -> Result<Self, TableError> {
        let table = Self::for_location(location).with_config(config);

        if let Some(current_version) = table
            .store
            .latest_version()
            .await
            .context(TransactionLogSnafu)?
        {
            return error::AlreadyExistsSnafu { current_version }.fail();
        }

        table.commit_create(metadata).await?;
        log::info!("created table at {}", table.location());
        Ok(table)
    }

    /// Commit protocol and metadata as version 0.
    ///
    /// Losing the race for version 0 to another creator is reported as
    /// [`TableError::AlreadyExists`].
    async fn commit_create(&self, metadata: Metadata) -> Result<u64, TableError> {
        let effective = self
            .config
            .with_table_properties(&metadata.configuration)
            .context(ConfigSnafu)?;

        let operation = Operation::Create {
            mode: SaveMode::ErrorIfExists,
            location: Some(self.location().to_string()),
            partition_by: metadata.partition_columns.clone(),
            properties: metadata.configuration.clone(),
        };

        let mut tx = Transaction::new(self.store.clone(), self.cache.clone(), effective, None)
            .context(TransactionLogSnafu)?;
        let committed = tx
            .commit_actions(
                [
                    Action::Protocol(Protocol::default()),
                    Action::Metadata(metadata),
                ],
                operation,
            )
            .await;

        match committed {
            Ok(version) => Ok(version),
            Err(source) if source.is_concurrent_modification() => {
                match self.store.latest_version().await.context(TransactionLogSnafu)? {
                    Some(current_version) => {
                        log::debug!("lost the race to create {}", self.location());
                        error::AlreadyExistsSnafu { current_version }.fail()
                    }
                    None => Err(TableError::TransactionLog { source }),
                }
            }
            Err(source) => Err(TableError::TransactionLog { source }),
        }
    }

    /// Location of the table root.
    pub fn location(&self) -> &TableLocation {
        self.store.location()
    }

    /// The underlying log store.
    pub fn log_store(&self) -> &TransactionLogStore {
        &self.store
    }

    /// The handle's configuration, before table-property overrides.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Latest committed version.
    pub async fn latest_version(&self) -> Result<Option<u64>, TableError> {
        self.store
            .latest_version()
            .await
            .context(TransactionLogSnafu)
    }

    /// Snapshot at the latest version.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>, TableError> {
        self.store
            .cached_snapshot(None, &self.cache)
            .await
            .context(TransactionLogSnafu)
    }

    /// Snapshot at `version`.
    pub async fn snapshot_at(&self, version: u64) -> Result<Arc<Snapshot>, TableError> {
        self.store
            .cached_snapshot(Some(version), &self.cache)
            .await
            .context(TransactionLogSnafu)
    }

    /// Snapshot of the newest version committed at or before `timestamp`.
    pub async fn snapshot_as_of(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Arc<Snapshot>, TableError> {
        let version = self
            .store
            .version_at_or_before(timestamp)
            .await
            .context(TransactionLogSnafu)?;
        self.snapshot_at(version).await
    }

    /// Configuration with the latest snapshot's table properties applied.
    pub async fn effective_config(&self) -> Result<LogConfig, TableError> {
        let snapshot = self.snapshot().await?;
        self.config
            .with_table_properties(snapshot.table_properties())
            .context(ConfigSnafu)
    }

    /// Start a transaction reading from the latest snapshot.
    pub async fn start_transaction(&self) -> Result<Transaction, TableError> {
        let snapshot = self.snapshot().await?;
        let config = self
            .config
            .with_table_properties(snapshot.table_properties())
            .context(ConfigSnafu)?;
        Transaction::new(
            self.store.clone(),
            self.cache.clone(),
            config,
            Some(snapshot),
        )
        .context(TransactionLogSnafu)
    }

    /// Commit history, newest first.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, TableError> {
        self.store
            .history(limit)
            .await
            .context(TransactionLogSnafu)
    }

    /// Write a checkpoint at the latest version.
    pub async fn checkpoint(&self) -> Result<CheckpointInfo, TableError> {
        let snapshot = self.snapshot().await?;
        let config = self.effective_config().await?;
        self.store
            .write_checkpoint(&snapshot, config.checkpoint_part_size)
            .await
            .context(TransactionLogSnafu)
    }

    /// Write a checkpoint at `version` if the configured interval says one is due.
    pub async fn maybe_checkpoint(
        &self,
        version: u64,
    ) -> Result<Option<CheckpointInfo>, TableError> {
        let config = self.effective_config().await?;
        self.store
            .maybe_checkpoint(version, &config, &self.cache)
            .await
            .context(TransactionLogSnafu)
    }

    async fn cleanup_cutoff(
        &self,
        retention: Option<CalendarInterval>,
    ) -> Result<DateTime<Utc>, TableError> {
        let retention = match retention {
            Some(r) => r,
            None => self.effective_config().await?.log_retention,
        };
        Ok(retention.cutoff_before(Utc::now()))
    }

    /// Plan log cleanup; `None` uses the configured retention window.
    pub async fn expired_log_files(
        &self,
        retention: Option<CalendarInterval>,
    ) -> Result<CleanupPlan, TableError> {
        let cutoff = self.cleanup_cutoff(retention).await?;
        self.store
            .expired_log_files(cutoff)
            .await
            .context(TransactionLogSnafu)
    }

    /// Delete expired log files; `None` uses the configured retention window.
    pub async fn cleanup_expired_logs(
        &self,
        retention: Option<CalendarInterval>,
    ) -> Result<CleanupReport, TableError> {
        let cutoff = self.cleanup_cutoff(retention).await?;
        self.store
            .cleanup_expired_logs(cutoff)
            .await
            .context(TransactionLogSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction_log::AddFile;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn open_distinguishes_missing_root_from_non_table() -> TestResult {
        let tmp = TempDir::new()?;

        let missing = TableLocation::local(tmp.path().join("nope"));
        let err = LogTable::open(missing).await.expect_err("missing root");
        assert!(matches!(err, TableError::TableRootMissing { .. }));

        let err = LogTable::open(TableLocation::local(tmp.path()))
            .await
            .expect_err("no log");
        assert!(matches!(err, TableError::NotATable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn log_without_protocol_is_not_a_table() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        TransactionLogStore::new(location.clone())
            .write_commit(0, &[Action::Add(AddFile::new("a.parquet", 1))])
            .await?;

        let err = LogTable::open(location).await.expect_err("no protocol");
        assert!(matches!(err, TableError::NotATable { .. }), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn create_then_open_and_commit() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        let created = LogTable::create(location.clone(), Metadata::new("{}", vec![])).await?;
        assert_eq!(created.latest_version().await?, Some(0));

        let err = LogTable::create(location.clone(), Metadata::new("{}", vec![]))
            .await
            .expect_err("second create");
        assert!(matches!(
            err,
            TableError::AlreadyExists { current_version: 0 }
        ));

        let table = LogTable::open(location).await?;
        let mut tx = table.start_transaction().await?;
        tx.add_file(AddFile::new("a.parquet", 10))?;
        assert_eq!(tx.commit(Operation::append()).await?, 1);

        let history = table.history(None).await?;
        assert_eq!(history[1].operation.as_deref(), Some("CREATE TABLE"));
        assert_eq!(table.snapshot().await?.num_files(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn losing_the_create_race_reports_already_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        // Both handles were built before either committed version 0.
        let winner = LogTable::for_location(location.clone());
        let loser = LogTable::for_location(location);
        assert_eq!(winner.commit_create(Metadata::new("{}", vec![])).await?, 0);

        let err = loser
            .commit_create(Metadata::new("{}", vec![]))
            .await
            .expect_err("version 0 is taken");
        assert!(
            matches!(err, TableError::AlreadyExists { current_version: 0 }),
            "{err:?}"
        );
        assert_eq!(winner.latest_version().await?, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_table_property_rejected_at_create() -> TestResult {
        let tmp = TempDir::new()?;
        let metadata = Metadata::new("{}", vec![])
            .with_property(crate::config::LOG_RETENTION_KEY, "interval 2 months");

        let err = LogTable::create(TableLocation::local(tmp.path()), metadata)
            .await
            .expect_err("months are ambiguous");
        assert!(matches!(err, TableError::Config { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn clones_share_the_snapshot_cache() -> TestResult {
        let tmp = TempDir::new()?;
        let table =
            LogTable::create(TableLocation::local(tmp.path()), Metadata::new("{}", vec![])).await?;
        let clone = table.clone();

        let a = table.snapshot().await?;
        let b = clone.snapshot().await?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }
}
