//! Integration tests for the transaction log.
//!
//! These tests drive tables end to end through the public handle:
//! - Sequential commits and the history they produce,
//! - Concurrent writers racing for the same version,
//! - Checkpointing plus retention and what remains reproducible,
//! - Reading commit files written by older or newer writers.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use chrono::{TimeDelta, Utc};
use tempfile::TempDir;
use table_log_core::config::LogConfig;
use table_log_core::storage::{TableLocation, layout};
use table_log_core::table::{LogTable, TableError};
use table_log_core::transaction_log::{
    Action, AddFile, CommitError, CommitInfo, Metadata, Operation, Protocol, RetryPolicy,
    SaveMode, TransactionLogStore, TransactionState,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

// =============================================================================
// Test Helpers
// =============================================================================

/// No automatic checkpoints and no sleeping between retries.
fn quiet_config() -> LogConfig {
    LogConfig::default()
        .checkpoint_interval(0)
        .retry(RetryPolicy::without_backoff(15))
}

fn sample_metadata() -> Metadata {
    Metadata::new(
        r#"{"type":"struct","fields":[{"name":"id","type":"long"}]}"#,
        vec![],
    )
}

async fn create_table(tmp: &TempDir, config: LogConfig) -> Result<LogTable, TableError> {
    LogTable::create_with_config(TableLocation::local(tmp.path()), sample_metadata(), config).await
}

async fn append(table: &LogTable, path: &str, size: i64) -> Result<u64, TableError> {
    let mut tx = table.start_transaction().await?;
    tx.add_file(AddFile::new(path, size))
        .map_err(|source| TableError::TransactionLog { source })?;
    tx.commit(Operation::append())
        .await
        .map_err(|source| TableError::TransactionLog { source })
}

fn age(tmp: &TempDir, rel: &std::path::Path, days: u64) -> TestResult {
    let file = std::fs::File::options()
        .write(true)
        .open(tmp.path().join(rel))?;
    file.set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))?;
    Ok(())
}

// =============================================================================
// History
// =============================================================================

#[tokio::test]
async fn sequential_commits_produce_descending_history() -> TestResult {
    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;

    for i in 1..10 {
        let v = append(&table, &format!("part-{i:04}.parquet"), 100).await?;
        assert_eq!(v, i);
    }

    let history = table.history(None).await?;
    let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
    assert_eq!(versions, (0..10).rev().collect::<Vec<_>>());
    assert_eq!(history.last().unwrap().operation.as_deref(), Some("CREATE TABLE"));

    let top3 = table.history(Some(3)).await?;
    assert_eq!(
        top3.iter().map(|e| e.version).collect::<Vec<_>>(),
        vec![9, 8, 7]
    );
    Ok(())
}

#[tokio::test]
async fn disabled_commit_info_leaves_null_rows_that_later_commits_do_not_touch() -> TestResult {
    let tmp = TempDir::new()?;
    let location = TableLocation::local(tmp.path());
    create_table(&tmp, quiet_config()).await?;

    let silent =
        LogTable::open_with_config(location.clone(), quiet_config().commit_info_enabled(false))
            .await?;
    assert_eq!(append(&silent, "a.parquet", 1).await?, 1);

    let recording = LogTable::open_with_config(location, quiet_config()).await?;
    assert_eq!(append(&recording, "b.parquet", 1).await?, 2);

    let history = recording.history(None).await?;
    assert_eq!(history.len(), 3);

    assert_eq!(history[0].version, 2);
    assert_eq!(history[0].operation.as_deref(), Some("WRITE"));

    assert_eq!(history[1].version, 1);
    assert_eq!(history[1].operation, None);
    assert_eq!(history[1].operation_parameters, None);
    assert_eq!(history[1].operation_metrics, None);
    assert_eq!(history[1].read_version, None);
    Ok(())
}

#[tokio::test]
async fn overwrite_and_delete_are_described_in_history() -> TestResult {
    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;
    append(&table, "initial.parquet", 10).await?;

    let mut tx = table.start_transaction().await?;
    let snapshot = tx.snapshot().expect("read snapshot").clone();
    for file in snapshot.files().values() {
        tx.remove_file(file.to_remove(Utc::now()))?;
    }
    tx.add_file(AddFile::new("rewritten.parquet", 20))?;
    assert_eq!(tx.commit(Operation::overwrite()).await?, 2);

    let latest = table.history(Some(1)).await?;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].operation.as_deref(), Some("WRITE"));
    let params = latest[0].operation_parameters.as_ref().unwrap();
    assert_eq!(params.get("mode").map(String::as_str), Some("Overwrite"));
    assert_eq!(latest[0].is_blind_append, Some(false));

    let mut tx = table.start_transaction().await?;
    tx.mark_whole_table_read();
    tx.remove_file(AddFile::new("rewritten.parquet", 20).to_remove(Utc::now()))?;
    tx.commit(Operation::Delete {
        predicate: Some("  id  >  10\n AND id < 20 ".to_string()),
    })
    .await?;

    let latest = table.history(Some(1)).await?;
    assert_eq!(latest[0].operation.as_deref(), Some("DELETE"));
    let params = latest[0].operation_parameters.as_ref().unwrap();
    assert_eq!(
        params.get("predicate").map(String::as_str),
        Some("id > 10 AND id < 20")
    );
    let metrics = latest[0].operation_metrics.as_ref().unwrap();
    assert_eq!(metrics.get("numRemovedFiles").map(String::as_str), Some("1"));
    assert_eq!(table.snapshot().await?.num_files(), 0);
    Ok(())
}

#[tokio::test]
async fn history_skips_commits_whose_bytes_cannot_be_read() -> TestResult {
    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;
    for i in 1..4 {
        append(&table, &format!("part-{i:04}.parquet"), 10).await?;
    }
    std::fs::write(tmp.path().join(layout::commit_rel_path(2)), b"\xff\xfe\n")?;

    let versions: Vec<u64> = table
        .history(None)
        .await?
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![3, 1, 0]);

    let limited = table.history(Some(2)).await?;
    assert_eq!(limited.iter().map(|e| e.version).collect::<Vec<_>>(), vec![3, 1]);
    Ok(())
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn read_version_reflects_the_last_reconciled_version() -> TestResult {
    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;

    let mut slow = table.start_transaction().await?;
    slow.add_file(AddFile::new("slow.parquet", 1))?;
    assert_eq!(slow.read_version(), Some(0));

    append(&table, "fast-1.parquet", 1).await?;
    append(&table, "fast-2.parquet", 1).await?;

    let version = slow.commit(Operation::append()).await?;
    assert_eq!(version, 3);
    assert!(
        slow.transitions()
            .iter()
            .any(|s| matches!(s, TransactionState::Retrying { read_version: 2, .. }))
    );

    let entry = table.log_store().history_entry(3).await?.unwrap();
    assert_eq!(entry.read_version, Some(2));
    Ok(())
}

#[tokio::test]
async fn two_writers_from_the_same_version_both_commit() -> TestResult {
    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;

    let mut a = table.start_transaction().await?;
    let mut b = table.start_transaction().await?;
    a.add_file(AddFile::new("a.parquet", 1))?;
    b.add_file(AddFile::new("b.parquet", 1))?;

    assert_eq!(a.commit(Operation::append()).await?, 1);
    assert_eq!(b.commit(Operation::append()).await?, 2);

    let snapshot = table.snapshot().await?;
    assert_eq!(
        snapshot.file_paths().collect::<Vec<_>>(),
        vec!["a.parquet", "b.parquet"]
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_removal_of_the_same_file_fails_the_loser() -> TestResult {
    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;
    append(&table, "shared.parquet", 1).await?;

    let mut a = table.start_transaction().await?;
    let mut b = table.start_transaction().await?;
    let remove = AddFile::new("shared.parquet", 1).to_remove(Utc::now());
    a.remove_file(remove.clone())?;
    b.remove_file(remove)?;

    a.commit(Operation::Delete { predicate: None }).await?;
    let err = b
        .commit(Operation::Delete { predicate: None })
        .await
        .expect_err("delete-delete conflict");
    assert!(err.is_concurrent_modification());
    assert_eq!(b.state(), &TransactionState::Failed);
    assert_eq!(table.latest_version().await?, Some(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_writers_on_many_threads_all_succeed() -> TestResult {
    const WRITERS: u64 = 8;

    let tmp = TempDir::new()?;
    let table = create_table(&tmp, quiet_config()).await?;

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let table = table.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = table.start_transaction().await?;
            tx.add_file(AddFile::new(format!("writer-{i}.parquet"), 10))
                .map_err(|source| TableError::TransactionLog { source })?;
            tx.commit(Operation::append())
                .await
                .map_err(|source| TableError::TransactionLog { source })
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await??);
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=WRITERS).collect::<Vec<_>>());

    let snapshot = table.snapshot_at(WRITERS).await?;
    assert_eq!(snapshot.num_files() as u64, WRITERS);
    assert_eq!(snapshot.total_size(), 10 * WRITERS as i64);
    Ok(())
}

// =============================================================================
// Checkpoints and retention
// =============================================================================

#[tokio::test]
async fn checkpoint_and_retention_trim_history_to_reproducible_versions() -> TestResult {
    let tmp = TempDir::new()?;
    let config = quiet_config()
        .checkpoint_interval(5)
        .expired_log_cleanup_enabled(false);
    let table = create_table(&tmp, config).await?;

    for i in 1..8 {
        append(&table, &format!("part-{i}.parquet"), 1).await?;
    }
    let checkpoints = table.log_store().list_checkpoints().await?;
    assert_eq!(
        checkpoints.iter().map(|c| c.version).collect::<Vec<_>>(),
        vec![5]
    );

    let report = table
        .log_store()
        .cleanup_expired_logs(Utc::now() + TimeDelta::days(1))
        .await?;
    assert_eq!(report.deleted_commits, vec![0, 1, 2, 3, 4]);
    assert_eq!(report.retained_from, Some(5));

    let versions: Vec<u64> = table
        .history(None)
        .await?
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![7, 6, 5]);

    // A fresh handle has no cached snapshots to fall back on.
    let reopened = LogTable::open(table.location().clone()).await?;
    assert_eq!(reopened.snapshot().await?.num_files(), 7);
    assert_eq!(reopened.snapshot_at(5).await?.num_files(), 5);

    let err = reopened.snapshot_at(2).await.expect_err("pruned version");
    assert!(matches!(
        err,
        TableError::TransactionLog {
            source: CommitError::VersionNotReproducible {
                version: 2,
                earliest: Some(5),
                ..
            }
        }
    ));
    Ok(())
}

#[tokio::test]
async fn checkpoint_triggers_cleanup_of_aged_commits() -> TestResult {
    let tmp = TempDir::new()?;
    let config = quiet_config().checkpoint_interval(3);
    let table = create_table(&tmp, config).await?;
    append(&table, "a.parquet", 1).await?;
    append(&table, "b.parquet", 1).await?;

    for v in 0..3 {
        age(&tmp, &layout::commit_rel_path(v), 40)?;
    }

    // Version 3 is checkpointed; the default 30 day window then expires 0..=2.
    append(&table, "c.parquet", 1).await?;

    let store = table.log_store();
    assert_eq!(store.earliest_commit_version().await?, Some(3));
    assert_eq!(store.read_last_checkpoint().await?.map(|c| c.version), Some(3));
    assert_eq!(table.history(None).await?.len(), 1);
    assert_eq!(table.snapshot().await?.num_files(), 3);
    Ok(())
}

#[tokio::test]
async fn table_properties_override_the_handle_configuration() -> TestResult {
    let tmp = TempDir::new()?;
    let metadata = sample_metadata().with_property("delta.checkpointInterval", "2");
    let table = LogTable::create_with_config(
        TableLocation::local(tmp.path()),
        metadata,
        quiet_config(),
    )
    .await?;
    assert_eq!(table.effective_config().await?.checkpoint_interval, 2);

    append(&table, "a.parquet", 1).await?;
    append(&table, "b.parquet", 1).await?;

    let last = table.log_store().read_last_checkpoint().await?;
    assert_eq!(last.map(|c| c.version), Some(2));
    Ok(())
}

// =============================================================================
// Commit file compatibility
// =============================================================================

#[tokio::test]
async fn commit_files_round_trip_by_value() -> TestResult {
    let tmp = TempDir::new()?;
    let store = TransactionLogStore::new(TableLocation::local(tmp.path()));

    let actions = vec![
        Action::CommitInfo(CommitInfo {
            timestamp: Some(1_735_689_600_000),
            operation: Some("CREATE TABLE".to_string()),
            operation_parameters: Some(BTreeMap::from([(
                "mode".to_string(),
                SaveMode::ErrorIfExists.as_str().to_string(),
            )])),
            ..Default::default()
        }),
        Action::Protocol(Protocol::default()),
        Action::Metadata(sample_metadata().with_property("owner", "ops")),
        Action::Add(
            AddFile::new("date=2024-01-01/part-0.parquet", 512)
                .with_partition_value("date", Some("2024-01-01".to_string())),
        ),
        Action::Add(AddFile::new("null-part.parquet", 1).with_partition_value("date", None)),
    ];

    store.write_commit(0, &actions).await?;
    assert_eq!(store.read_commit(0).await?, actions);
    Ok(())
}

#[tokio::test]
async fn historical_and_future_records_are_readable() -> TestResult {
    let tmp = TempDir::new()?;
    let store = TransactionLogStore::new(TableLocation::local(tmp.path()));
    let commit = tmp.path().join(layout::commit_rel_path(0));
    tokio::fs::create_dir_all(commit.parent().unwrap()).await?;

    let contents = [
        // An old writer: commit info without metrics, isolation or readVersion.
        r#"{"commitInfo":{"timestamp":1600000000000,"operation":"WRITE","operationParameters":{"mode":"Append"}}}"#,
        r#"{"protocol":{"minReaderVersion":1,"minWriterVersion":2}}"#,
        r#"{"metaData":{"id":"t-1","format":{"provider":"parquet","options":{}},"schemaString":"{}","partitionColumns":[],"configuration":{}}}"#,
        // A newer writer: unknown fields and an unknown action type.
        r#"{"add":{"path":"a.parquet","partitionValues":{},"size":7,"modificationTime":1,"dataChange":true,"deletionVector":null,"baseRowId":4}}"#,
        r#"{"txn":{"appId":"stream-1","version":3}}"#,
        "",
    ]
    .join("\n");
    tokio::fs::write(&commit, contents).await?;

    let actions = store.read_commit(0).await?;
    assert_eq!(actions.len(), 4);
    let Action::CommitInfo(info) = &actions[0] else {
        panic!("expected commitInfo first, got {:?}", actions[0]);
    };
    assert_eq!(info.operation_metrics, None);
    assert_eq!(info.read_version, None);

    let table = LogTable::open(TableLocation::local(tmp.path())).await?;
    let snapshot = table.snapshot().await?;
    assert_eq!(snapshot.file_paths().collect::<Vec<_>>(), vec!["a.parquet"]);
    Ok(())
}
