//! CLI tool for inspecting and maintaining transaction-log tables.

mod error;
mod render;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use snafu::ResultExt;
use table_log_core::{
    config::CalendarInterval,
    storage::TableLocation,
    table::LogTable,
    transaction_log::Metadata,
};

use crate::error::{
    CheckpointSnafu, CleanupSnafu, CliResult, CreateTableSnafu, InvalidPropertySnafu,
    InvalidRetentionSnafu, OpenTableSnafu, ReadLogSnafu, StorageSnafu,
};

const EMPTY_SCHEMA: &str = r#"{"type":"struct","fields":[]}"#;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HistoryFormat {
    Table,
    Jsonl,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a table: commit version 0 with protocol and metadata
    Create {
        #[arg(long)]
        table: PathBuf,

        /// Serialized table schema (opaque to the log)
        #[arg(long, default_value = EMPTY_SCHEMA)]
        schema: String,

        /// Repeatable partition column names
        #[arg(long = "partition-by")]
        partition_by: Vec<String>,

        /// Repeatable table properties, e.g. delta.checkpointInterval=5
        #[arg(long = "property")]
        properties: Vec<String>,
    },

    /// Show commit history, newest first
    History {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, value_enum, default_value_t = HistoryFormat::Table)]
        format: HistoryFormat,
    },

    /// Show the table state at a version (default: latest)
    Snapshot {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        version: Option<u64>,

        /// Also list the active files
        #[arg(long, default_value_t = false)]
        files: bool,
    },

    /// Write a checkpoint at the latest version
    Checkpoint {
        #[arg(long)]
        table: PathBuf,
    },

    /// Delete expired commit and checkpoint files
    Cleanup {
        #[arg(long)]
        table: PathBuf,

        /// Retention window, e.g. "interval 30 days" (default: table setting)
        #[arg(long)]
        retention: Option<String>,

        /// Only list what would be deleted
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Debug, Parser)]
#[command(name = "tlog", version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

fn parse_location(table: &Path) -> CliResult<TableLocation> {
    TableLocation::parse(table.to_string_lossy().as_ref()).context(StorageSnafu)
}

fn parse_property(spec: &str) -> CliResult<(String, String)> {
    match spec.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => InvalidPropertySnafu { spec }.fail(),
    }
}

fn parse_retention(spec: &str) -> CliResult<CalendarInterval> {
    spec.parse::<CalendarInterval>()
        .context(InvalidRetentionSnafu { spec })
}

async fn open_table(table: &Path) -> CliResult<LogTable> {
    let location = parse_location(table)?;
    log::debug!("opening table at {location}");
    LogTable::open(location).await.context(OpenTableSnafu {
        table: table.display().to_string(),
    })
}

async fn cmd_create(
    table: &Path,
    schema: String,
    partition_by: Vec<String>,
    properties: Vec<String>,
) -> CliResult<()> {
    let configuration = properties
        .iter()
        .map(|p| parse_property(p))
        .collect::<CliResult<BTreeMap<_, _>>>()?;
    let mut metadata = Metadata::new(schema, partition_by);
    metadata.configuration = configuration;

    let location = parse_location(table)?;
    LogTable::create(location, metadata)
        .await
        .context(CreateTableSnafu {
            table: table.display().to_string(),
        })?;

    println!("Created table at {}", table.display());
    Ok(())
}

async fn cmd_history(table: &Path, limit: Option<usize>, format: HistoryFormat) -> CliResult<()> {
    let t = open_table(table).await?;
    let entries = t.history(limit).await.context(ReadLogSnafu {
        table: table.display().to_string(),
    })?;

    match format {
        HistoryFormat::Table => println!("{}", render::history_table(&entries)),
        HistoryFormat::Jsonl => print!("{}", render::history_jsonl(&entries)?),
    }
    Ok(())
}

async fn cmd_snapshot(table: &Path, version: Option<u64>, files: bool) -> CliResult<()> {
    let t = open_table(table).await?;
    let snapshot = match version {
        Some(v) => t.snapshot_at(v).await,
        None => t.snapshot().await,
    }
    .context(ReadLogSnafu {
        table: table.display().to_string(),
    })?;

    println!("{}", render::snapshot_summary(&snapshot));
    if files {
        println!("{}", render::files_table(&snapshot));
    }
    Ok(())
}

async fn cmd_checkpoint(table: &Path) -> CliResult<()> {
    let t = open_table(table).await?;
    let info = t.checkpoint().await.context(CheckpointSnafu {
        table: table.display().to_string(),
    })?;

    match info.parts {
        Some(parts) => println!(
            "Checkpoint written at version {} ({} actions in {parts} parts)",
            info.version, info.size
        ),
        None => println!(
            "Checkpoint written at version {} ({} actions)",
            info.version, info.size
        ),
    }
    Ok(())
}

async fn cmd_cleanup(table: &Path, retention: Option<String>, dry_run: bool) -> CliResult<()> {
    let retention = retention.as_deref().map(parse_retention).transpose()?;
    let t = open_table(table).await?;
    let ctx = CleanupSnafu {
        table: table.display().to_string(),
    };

    if dry_run {
        let plan = t.expired_log_files(retention).await.context(ctx)?;
        for file in plan.files() {
            println!("would delete {}", file.rel_path.display());
        }
        println!("Would delete {} file(s)", plan.len());
        return Ok(());
    }

    let report = t.cleanup_expired_logs(retention).await.context(ctx)?;
    let retained = report
        .retained_from
        .map_or_else(|| "unknown".to_string(), |v| v.to_string());
    println!(
        "Deleted {} commit(s) and {} checkpoint(s); history starts at version {retained}",
        report.deleted_commits.len(),
        report.deleted_checkpoints.len(),
    );
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Create {
            table,
            schema,
            partition_by,
            properties,
        } => cmd_create(&table, schema, partition_by, properties).await,

        Command::History {
            table,
            limit,
            format,
        } => cmd_history(&table, limit, format).await,

        Command::Snapshot {
            table,
            version,
            files,
        } => cmd_snapshot(&table, version, files).await,

        Command::Checkpoint { table } => cmd_checkpoint(&table).await,

        Command::Cleanup {
            table,
            retention,
            dry_run,
        } => cmd_cleanup(&table, retention, dry_run).await,
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;

    #[test]
    fn property_needs_a_key_and_an_equals_sign() {
        assert_eq!(
            parse_property("delta.checkpointInterval = 5").ok(),
            Some(("delta.checkpointInterval".to_string(), "5".to_string()))
        );
        assert!(matches!(
            parse_property("no-equals"),
            Err(CliError::InvalidProperty { .. })
        ));
        assert!(matches!(
            parse_property("=5"),
            Err(CliError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn retention_rejects_months() {
        assert!(parse_retention("interval 7 days").is_ok());
        assert!(matches!(
            parse_retention("interval 1 month"),
            Err(CliError::InvalidRetention { .. })
        ));
    }

    #[test]
    fn cli_parses_cleanup_flags() {
        let cli = Cli::try_parse_from([
            "tlog",
            "cleanup",
            "--table",
            "/tmp/t",
            "--retention",
            "12 hours",
            "--dry-run",
        ])
        .expect("valid args");
        assert!(matches!(
            cli.cmd,
            Command::Cleanup {
                dry_run: true,
                retention: Some(_),
                ..
            }
        ));
    }
}
