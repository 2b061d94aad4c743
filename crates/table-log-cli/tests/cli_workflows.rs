//! Integration tests for the `tlog` binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use table_log_core::storage::TableLocation;
use table_log_core::table::LogTable;
use table_log_core::transaction_log::{AddFile, Operation};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("tlog"))
}

fn table_root(tmp: &TempDir) -> PathBuf {
    tmp.path().join("t")
}

fn create(table: &Path, extra: &[&str]) {
    let table = table.to_string_lossy();
    let mut args = vec!["create", "--table", table.as_ref()];
    args.extend_from_slice(extra);
    cli()
        .args(args)
        .assert()
        .success()
        .stdout(contains("Created table at"));
}

/// Append `n` files through the library, one commit each.
fn append_files(table: &Path, n: usize) -> TestResult {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let t = LogTable::open(TableLocation::local(table)).await?;
        for i in 0..n {
            let mut tx = t.start_transaction().await?;
            tx.add_file(AddFile::new(format!("part-{i:04}.parquet"), 64))?;
            tx.commit(Operation::append()).await?;
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

#[test]
fn history_lists_versions_newest_first() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    create(&table, &[]);
    append_files(&table, 2)?;

    cli()
        .args(["history", "--table", table.to_string_lossy().as_ref()])
        .assert()
        .success()
        .stdout(contains("CREATE TABLE").and(contains("WRITE")));

    let output = cli()
        .args([
            "history",
            "--table",
            table.to_string_lossy().as_ref(),
            "--format",
            "jsonl",
            "--limit",
            "2",
        ])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    let versions: Vec<u64> = stdout
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line)?;
            Ok(value["version"].as_u64().unwrap_or(u64::MAX))
        })
        .collect::<Result<_, serde_json::Error>>()?;
    assert_eq!(versions, vec![2, 1]);
    Ok(())
}

#[test]
fn snapshot_shows_files_and_partitioning() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    create(
        &table,
        &["--partition-by", "date", "--property", "owner=ops"],
    );
    append_files(&table, 3)?;

    cli()
        .args([
            "snapshot",
            "--table",
            table.to_string_lossy().as_ref(),
            "--files",
        ])
        .assert()
        .success()
        .stdout(
            contains("version: 3")
                .and(contains("files: 3"))
                .and(contains("partition columns: [date]"))
                .and(contains("property owner = ops"))
                .and(contains("part-0002.parquet")),
        );

    cli()
        .args([
            "snapshot",
            "--table",
            table.to_string_lossy().as_ref(),
            "--version",
            "1",
        ])
        .assert()
        .success()
        .stdout(contains("files: 1"));
    Ok(())
}

#[test]
fn checkpoint_then_cleanup_prunes_history() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    create(&table, &["--property", "delta.checkpointInterval=100"]);
    append_files(&table, 3)?;

    cli()
        .args(["checkpoint", "--table", table.to_string_lossy().as_ref()])
        .assert()
        .success()
        .stdout(contains("Checkpoint written at version 3"));

    // Nothing is old enough under the default window.
    cli()
        .args([
            "cleanup",
            "--table",
            table.to_string_lossy().as_ref(),
            "--dry-run",
        ])
        .assert()
        .success()
        .stdout(contains("Would delete 0 file(s)"));

    // Backdate the commits that the checkpoint covers.
    for v in 0..3u64 {
        let path = table.join("_delta_log").join(format!("{v:020}.json"));
        let file = std::fs::File::options().write(true).open(path)?;
        file.set_modified(
            std::time::SystemTime::now() - std::time::Duration::from_secs(3 * 86_400),
        )?;
    }

    cli()
        .args([
            "cleanup",
            "--table",
            table.to_string_lossy().as_ref(),
            "--retention",
            "interval 1 day",
        ])
        .assert()
        .success()
        .stdout(contains("Deleted 3 commit(s)").and(contains("history starts at version 3")));

    cli()
        .args([
            "history",
            "--table",
            table.to_string_lossy().as_ref(),
            "--format",
            "jsonl",
        ])
        .assert()
        .success()
        .stdout(contains(r#""version":3"#).and(contains(r#""version":2"#).not()));
    Ok(())
}

#[test]
fn errors_are_reported_with_exit_code_one() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);

    cli()
        .args(["history", "--table", table.to_string_lossy().as_ref()])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("Failed to open table"));

    create(&table, &[]);
    cli()
        .args(["create", "--table", table.to_string_lossy().as_ref()])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("Failed to create table"));

    cli()
        .args([
            "cleanup",
            "--table",
            table.to_string_lossy().as_ref(),
            "--retention",
            "interval 2 months",
        ])
        .assert()
        .failure()
        .stderr(contains("Invalid --retention"));
    Ok(())
}
