//! Text rendering of history rows and snapshot contents.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use tabled::{builder::Builder, settings::Style};
use table_log_core::transaction_log::{HistoryEntry, Snapshot};

use crate::error::{CliResult, JsonSnafu};
use snafu::ResultExt;

const NULL: &str = "null";

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn compact_map(map: Option<&BTreeMap<String, String>>) -> String {
    match map {
        Some(m) if !m.is_empty() => m
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        Some(_) => String::new(),
        None => NULL.to_string(),
    }
}

fn or_null<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| NULL.to_string(), |v| v.to_string())
}

fn render(builder: Builder) -> String {
    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}

/// History as a table, one row per version.
pub fn history_table(entries: &[HistoryEntry]) -> String {
    let mut builder = Builder::default();
    builder.push_record([
        "version",
        "timestamp",
        "operation",
        "parameters",
        "readVersion",
        "isolationLevel",
        "blindAppend",
        "metrics",
    ]);
    for e in entries {
        builder.push_record([
            e.version.to_string(),
            timestamp(e.timestamp),
            or_null(e.operation.as_deref()),
            compact_map(e.operation_parameters.as_ref()),
            or_null(e.read_version),
            or_null(e.isolation_level),
            or_null(e.is_blind_append),
            compact_map(e.operation_metrics.as_ref()),
        ]);
    }
    render(builder)
}

/// History as JSON lines, newest first.
pub fn history_jsonl(entries: &[HistoryEntry]) -> CliResult<String> {
    let mut out = String::new();
    for e in entries {
        out.push_str(&serde_json::to_string(e).context(JsonSnafu)?);
        out.push('\n');
    }
    Ok(out)
}

/// Key facts about a snapshot, one per line.
pub fn snapshot_summary(snapshot: &Snapshot) -> String {
    let metadata = snapshot.metadata();
    let protocol = snapshot.protocol();
    let mut lines = vec![
        format!("version: {}", snapshot.version()),
        format!("table id: {}", metadata.id),
        format!(
            "protocol: reader {} / writer {}",
            protocol.min_reader_version, protocol.min_writer_version
        ),
        format!("files: {}", snapshot.num_files()),
        format!("total size: {} bytes", snapshot.total_size()),
        format!(
            "partition columns: [{}]",
            snapshot.partition_columns().join(", ")
        ),
    ];
    for (key, value) in snapshot.table_properties() {
        lines.push(format!("property {key} = {value}"));
    }
    lines.join("\n")
}

/// Active files of a snapshot as a table.
pub fn files_table(snapshot: &Snapshot) -> String {
    let mut builder = Builder::default();
    builder.push_record(["path", "size", "partitionValues", "modificationTime"]);
    for file in snapshot.files().values() {
        let partitions = file
            .partition_values
            .iter()
            .map(|(k, v)| format!("{k}={}", v.as_deref().unwrap_or(NULL)))
            .collect::<Vec<_>>()
            .join(", ");
        let modified = DateTime::<Utc>::from_timestamp_millis(file.modification_time)
            .map_or_else(|| file.modification_time.to_string(), timestamp);
        builder.push_record([file.path.clone(), file.size.to_string(), partitions, modified]);
    }
    render(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: u64, operation: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            version,
            timestamp: DateTime::<Utc>::from_timestamp_millis(1_735_689_600_000)
                .expect("valid millis"),
            operation: operation.map(str::to_string),
            operation_parameters: operation
                .map(|_| BTreeMap::from([("mode".to_string(), "Append".to_string())])),
            read_version: version.checked_sub(1),
            isolation_level: None,
            is_blind_append: Some(true),
            operation_metrics: None,
            user_metadata: None,
        }
    }

    #[test]
    fn history_table_shows_nulls_for_missing_commit_info() {
        let out = history_table(&[entry(1, Some("WRITE")), entry(0, None)]);
        assert!(out.contains("WRITE"));
        assert!(out.contains("mode=Append"));
        assert!(out.contains("2025-01-01T00:00:00.000Z"));
        assert!(out.contains(NULL));
    }

    #[test]
    fn history_jsonl_is_one_object_per_line() -> CliResult<()> {
        let out = history_jsonl(&[entry(1, Some("WRITE")), entry(0, None)])?;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""version":1"#));
        assert!(lines[0].contains(r#""readVersion":0"#));
        assert!(lines[1].contains(r#""operation":null"#));
        Ok(())
    }
}
