//! Optimistic transactions.
//!
//! A [`Transaction`] captures the snapshot it reads from (its *read version*),
//! accumulates staged actions without touching durable state, and at commit
//! time tries to create the commit file for `read_version + 1`. Losing that
//! race is expected: the winning commit is checked for semantic conflicts
//! against what the transaction staged and read, and if there is none the
//! transaction rebases onto the winner and tries the next version. The number
//! of attempts is bounded by a [`RetryPolicy`].
//!
//! Every state change is recorded, so callers and tests can inspect exactly
//! how a commit went:
//!
//! ```text
//! Open -> Committing -> Committed
//!              |
//!              +-> Conflicted -> Retrying -> Committing -> ...
//!              |        |
//!              |        +-> Failed (semantic conflict or retries exhausted)
//!              +-> Failed (storage error)
//! Open -> Abandoned
//! ```
//!
//! After a successful commit a checkpoint is written when the configured
//! interval says one is due, followed by log cleanup. Both are best-effort:
//! their failures are logged and never fail the commit.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snafu::prelude::*;

use crate::config::LogConfig;
use crate::transaction_log::conflict::{
    ConflictError, RetriesExhaustedSnafu, TransactionFootprint, check_winning_commit,
};
use crate::transaction_log::snapshot::{Snapshot, SnapshotCache};
use crate::transaction_log::{
    Action, AddFile, CommitError, CommitInfo, IsolationLevel, Metadata, NotATableSnafu, Operation,
    Protocol, RemoveFile, TransactionClosedSnafu, TransactionLogStore, check_writer_protocol,
};

/// Bounds and pacing of commit retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Sleep before the first retry; doubled for every further retry.
    pub initial_backoff: Duration,
    /// Upper bound on the sleep between retries.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 15,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries up to `max_retries` times without sleeping.
    pub const fn without_backoff(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting staged actions.
    Open,
    /// Trying to create the commit file for `version`.
    Committing {
        /// 1-based attempt number.
        attempt: u32,
        /// Version being written.
        version: u64,
    },
    /// Another writer created `winning_version` first.
    Conflicted {
        /// Attempt that lost the race.
        attempt: u32,
        /// Version the other writer committed.
        winning_version: u64,
    },
    /// The winning commit did not conflict; the transaction rebased onto it.
    Retrying {
        /// Attempt that lost the race.
        attempt: u32,
        /// New read version.
        read_version: u64,
    },
    /// The commit is durable.
    Committed {
        /// Committed version.
        version: u64,
    },
    /// The commit failed; nothing was written.
    Failed,
    /// The caller gave up before committing.
    Abandoned,
}

impl TransactionState {
    /// Whether the transaction still accepts staged actions.
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Open)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Committing { attempt, version } => {
                write!(f, "committing version {version} (attempt {attempt})")
            }
            TransactionState::Conflicted {
                attempt,
                winning_version,
            } => write!(
                f,
                "conflicted with version {winning_version} (attempt {attempt})"
            ),
            TransactionState::Retrying {
                attempt,
                read_version,
            } => write!(f, "retrying from version {read_version} (after attempt {attempt})"),
            TransactionState::Committed { version } => write!(f, "committed version {version}"),
            TransactionState::Failed => write!(f, "failed"),
            TransactionState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A single writer's unit of work against a table.
#[derive(Debug)]
pub struct Transaction {
    store: TransactionLogStore,
    cache: SnapshotCache,
    config: LogConfig,
    read_snapshot: Option<Arc<Snapshot>>,
    isolation_level: IsolationLevel,
    staged: Vec<Action>,
    read_files: BTreeSet<String>,
    read_whole_table: bool,
    operation_metrics: BTreeMap<String, String>,
    user_metadata: Option<String>,
    state: TransactionState,
    transitions: Vec<TransactionState>,
}

impl Transaction {
    /// Start a transaction reading from `read_snapshot`, or creating the table
    /// when there is none.
    pub(crate) fn new(
        store: TransactionLogStore,
        cache: SnapshotCache,
        config: LogConfig,
        read_snapshot: Option<Arc<Snapshot>>,
    ) -> Result<Self, CommitError> {
        if let Some(snapshot) = &read_snapshot {
            check_writer_protocol(snapshot.protocol())?;
        }
        Ok(Self {
            store,
            cache,
            isolation_level: config.isolation_level,
            config,
            read_snapshot,
            staged: Vec::new(),
            read_files: BTreeSet::new(),
            read_whole_table: false,
            operation_metrics: BTreeMap::new(),
            user_metadata: None,
            state: TransactionState::Open,
            transitions: vec![TransactionState::Open],
        })
    }

    /// Version the transaction reads from; `None` when creating a table.
    pub fn read_version(&self) -> Option<u64> {
        self.read_snapshot.as_ref().map(|s| s.version())
    }

    /// The snapshot reads are served from.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.read_snapshot.as_deref()
    }

    /// Current state.
    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// Every state the transaction has been in, oldest first.
    pub fn transitions(&self) -> &[TransactionState] {
        &self.transitions
    }

    /// Isolation level used for conflict detection.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Override the isolation level.
    #[must_use]
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Metrics merged into `commitInfo.operationMetrics`, overriding derived ones.
    #[must_use]
    pub fn with_operation_metrics<K, V>(mut self, metrics: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        self.operation_metrics
            .extend(metrics.into_iter().map(|(k, v)| (k.into(), v.to_string())));
        self
    }

    /// Free-form metadata recorded in `commitInfo.userMetadata`.
    #[must_use]
    pub fn with_user_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.user_metadata = Some(metadata.into());
        self
    }

    /// Actions staged so far.
    pub fn staged_actions(&self) -> &[Action] {
        &self.staged
    }

    fn ensure_open(&self) -> Result<(), CommitError> {
        ensure!(
            self.state.is_open(),
            TransactionClosedSnafu {
                state: self.state.to_string(),
            }
        );
        Ok(())
    }

    /// Stage an action.
    ///
    /// `commitInfo` is produced by the transaction itself, so staged
    /// `commitInfo` actions are dropped.
    pub fn add_action(&mut self, action: Action) -> Result<(), CommitError> {
        self.ensure_open()?;
        match action {
            Action::CommitInfo(_) => {
                log::debug!("dropping caller-staged commitInfo action");
            }
            Action::Protocol(protocol) => {
                check_writer_protocol(&protocol)?;
                self.staged.push(action);
            }
            other => self.staged.push(other),
        }
        Ok(())
    }

    /// Stage several actions, in order.
    pub fn add_actions(
        &mut self,
        actions: impl IntoIterator<Item = Action>,
    ) -> Result<(), CommitError> {
        for action in actions {
            self.add_action(action)?;
        }
        Ok(())
    }

    /// Stage a file addition.
    pub fn add_file(&mut self, file: AddFile) -> Result<(), CommitError> {
        self.add_action(Action::Add(file))
    }

    /// Stage a file removal.
    pub fn remove_file(&mut self, file: RemoveFile) -> Result<(), CommitError> {
        self.add_action(Action::Remove(file))
    }

    /// Stage a metadata replacement.
    pub fn update_metadata(&mut self, metadata: Metadata) -> Result<(), CommitError> {
        self.add_action(Action::Metadata(metadata))
    }

    /// Stage a protocol change.
    pub fn update_protocol(&mut self, protocol: Protocol) -> Result<(), CommitError> {
        self.add_action(Action::Protocol(protocol))
    }

    /// Record that the transaction's outcome depends on these files.
    pub fn mark_files_read<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_files.extend(paths.into_iter().map(Into::into));
    }

    /// Record that the transaction's outcome depends on the whole table.
    pub fn mark_whole_table_read(&mut self) {
        self.read_whole_table = true;
    }

    /// Give up on the transaction. Only possible before committing.
    pub fn abandon(&mut self) -> Result<(), CommitError> {
        self.ensure_open()?;
        self.transition(TransactionState::Abandoned);
        Ok(())
    }

    fn transition(&mut self, state: TransactionState) {
        log::debug!("transaction {} -> {}", self.state, state);
        self.transitions.push(state.clone());
        self.state = state;
    }

    fn fail<T>(&mut self, err: CommitError) -> Result<T, CommitError> {
        self.transition(TransactionState::Failed);
        Err(err)
    }

    /// Stage `actions` and commit them in one call.
    pub async fn commit_actions(
        &mut self,
        actions: impl IntoIterator<Item = Action>,
        operation: Operation,
    ) -> Result<u64, CommitError> {
        self.add_actions(actions)?;
        self.commit(operation).await
    }

    /// Commit the staged actions, recording `operation` in `commitInfo`.
    ///
    /// Returns the committed version.
    ///
    /// # Errors
    /// - [`CommitError::ConcurrentModification`] if a concurrent commit
    ///   conflicts with this one or the retry budget runs out.
    /// - [`CommitError::TransactionClosed`] if the transaction is not open.
    /// - [`CommitError::NotATable`] when creating a table without protocol and
    ///   metadata.
    /// - storage errors, unchanged.
    pub async fn commit(&mut self, operation: Operation) -> Result<u64, CommitError> {
        self.ensure_open()?;

        if self.read_snapshot.is_none() {
            let has = |kind: &str| self.staged.iter().any(|a| a.kind() == kind);
            if !(has("protocol") && has("metaData")) {
                return self.fail(
                    NotATableSnafu {
                        msg: "the first commit must contain protocol and metaData actions",
                    }
                    .build(),
                );
            }
        }

        let retry = self.config.retry;
        let mut read_version = self.read_version();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let version = read_version.map_or(0, |v| v + 1);
            self.transition(TransactionState::Committing { attempt, version });

            let actions = self.build_commit_actions(&operation, read_version);
            match self.store.write_commit(version, &actions).await {
                Ok(()) => {
                    self.transition(TransactionState::Committed { version });
                    log::debug!(
                        "committed version {version} ({}) after {attempt} attempt(s)",
                        operation.name()
                    );
                    self.run_post_commit_hook(version).await;
                    return Ok(version);
                }
                Err(CommitError::AlreadyExists { .. }) => {
                    self.transition(TransactionState::Conflicted {
                        attempt,
                        winning_version: version,
                    });
                }
                Err(e) => return self.fail(e),
            }

            let winning = match self.store.read_commit(version).await {
                Ok(actions) => actions,
                Err(e) => return self.fail(e),
            };
            let footprint = TransactionFootprint {
                staged: &self.staged,
                read_files: &self.read_files,
                read_whole_table: self.read_whole_table,
                isolation_level: self.isolation_level,
            };
            if let Err(source) = check_winning_commit(&footprint, version, &winning) {
                log::debug!("commit of version {version} conflicts: {source}");
                return self.fail(CommitError::ConcurrentModification { version, source });
            }

            if attempt > retry.max_retries {
                let source: ConflictError = RetriesExhaustedSnafu { attempts: attempt }.build();
                return self.fail(CommitError::ConcurrentModification { version, source });
            }

            read_version = Some(version);
            self.transition(TransactionState::Retrying {
                attempt,
                read_version: version,
            });

            let delay = retry.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn build_commit_actions(&self, operation: &Operation, read_version: Option<u64>) -> Vec<Action> {
        let mut actions = Vec::with_capacity(self.staged.len() + 1);
        if self.config.commit_info_enabled {
            actions.push(Action::CommitInfo(self.commit_info(operation, read_version)));
        }
        actions.extend(self.staged.iter().cloned());
        actions
    }

    fn commit_info(&self, operation: &Operation, read_version: Option<u64>) -> CommitInfo {
        CommitInfo {
            timestamp: Some(Utc::now().timestamp_millis()),
            operation: Some(operation.name().to_string()),
            operation_parameters: Some(operation.parameters()),
            read_version,
            isolation_level: Some(self.isolation_level),
            is_blind_append: Some(self.is_blind_append(operation)),
            operation_metrics: self
                .config
                .history_metrics_enabled
                .then(|| self.operation_metrics()),
            user_metadata: self.user_metadata.clone(),
        }
    }

    fn is_blind_append(&self, operation: &Operation) -> bool {
        operation.is_append()
            && !self.read_whole_table
            && self.read_files.is_empty()
            && self.staged.iter().all(|a| matches!(a, Action::Add(_)))
    }

    fn operation_metrics(&self) -> BTreeMap<String, String> {
        let (mut added_files, mut added_bytes) = (0u64, 0i64);
        let (mut removed_files, mut removed_bytes) = (0u64, 0i64);
        for action in &self.staged {
            match action {
                Action::Add(f) => {
                    added_files += 1;
                    added_bytes += f.size;
                }
                Action::Remove(r) => {
                    removed_files += 1;
                    removed_bytes += r.size.unwrap_or(0);
                }
                _ => {}
            }
        }

        let mut metrics = BTreeMap::from([
            ("numAddedFiles".to_string(), added_files.to_string()),
            ("numRemovedFiles".to_string(), removed_files.to_string()),
            ("numAddedBytes".to_string(), added_bytes.to_string()),
            ("numRemovedBytes".to_string(), removed_bytes.to_string()),
        ]);
        metrics.extend(self.operation_metrics.clone());
        metrics
    }

    /// Configuration in effect for the committed version.
    fn config_after_commit(&self) -> LogConfig {
        let staged_metadata = self.staged.iter().rev().find_map(|a| match a {
            Action::Metadata(m) => Some(m),
            _ => None,
        });
        let Some(metadata) = staged_metadata else {
            return self.config.clone();
        };
        match self.config.with_table_properties(&metadata.configuration) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring invalid table properties after commit: {e}");
                self.config.clone()
            }
        }
    }

    async fn run_post_commit_hook(&self, version: u64) {
        let config = self.config_after_commit();

        match self
            .store
            .maybe_checkpoint(version, &config, &self.cache)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                log::warn!("checkpoint after commit {version} failed: {e}");
                return;
            }
        }

        if !config.expired_log_cleanup_enabled {
            return;
        }
        let cutoff = config.log_retention.cutoff_before(Utc::now());
        if let Err(e) = self.store.cleanup_expired_logs(cutoff).await {
            log::warn!("log cleanup after commit {version} failed: {e}");
        }
    }
}
