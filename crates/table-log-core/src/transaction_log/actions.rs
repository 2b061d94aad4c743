//! Log actions: the typed records a commit is made of.
//!
//! A commit file holds one [`Action`] per line, each encoded as an externally
//! tagged JSON object with exactly one key (`add`, `remove`, `metaData`,
//! `protocol`, `commitInfo`). Readers ignore unknown fields inside known
//! actions, and skip whole lines whose key is an action type this crate does
//! not know yet, so logs written by newer writers stay readable. Every field
//! that was added after the first format revision is optional, so older logs
//! stay readable too.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest `minReaderVersion` this crate can read.
pub const MAX_SUPPORTED_READER_VERSION: i32 = 1;
/// Highest `minWriterVersion` this crate can write.
pub const MAX_SUPPORTED_WRITER_VERSION: i32 = 2;

/// Action keys written by other implementations that carry no state this crate
/// models. Lines tagged with these are skipped quietly.
const KNOWN_FOREIGN_ACTIONS: &[&str] = &[
    "txn",
    "cdc",
    "domainMetadata",
    "checkpointMetadata",
    "sidecar",
];

/// A single typed effect recorded in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// A data file became part of the table.
    Add(AddFile),
    /// A data file stopped being part of the table.
    Remove(RemoveFile),
    /// Table metadata (schema, partitioning, properties) was replaced.
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    /// Reader/writer protocol requirements changed.
    Protocol(Protocol),
    /// Provenance of the commit.
    CommitInfo(CommitInfo),
}

impl Action {
    /// Short tag used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Add(_) => "add",
            Action::Remove(_) => "remove",
            Action::Metadata(_) => "metaData",
            Action::Protocol(_) => "protocol",
            Action::CommitInfo(_) => "commitInfo",
        }
    }
}

/// Adds a data file to the table (or replaces the entry for the same path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    /// Path of the data file relative to the table root.
    pub path: String,
    /// Partition column values for this file; `None` is a null partition value.
    #[serde(default)]
    pub partition_values: BTreeMap<String, Option<String>>,
    /// File size in bytes.
    pub size: i64,
    /// Modification time of the data file, in milliseconds since the epoch.
    pub modification_time: i64,
    /// Whether this add changes the logical content of the table.
    pub data_change: bool,
    /// Engine-provided statistics, opaque to the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl AddFile {
    /// A data-changing add with no partition values, stamped with the current time.
    pub fn new(path: impl Into<String>, size: i64) -> Self {
        Self {
            path: path.into(),
            partition_values: BTreeMap::new(),
            size,
            modification_time: Utc::now().timestamp_millis(),
            data_change: true,
            stats: None,
            tags: None,
        }
    }

    /// Builder-style partition value.
    pub fn with_partition_value(mut self, column: impl Into<String>, value: Option<String>) -> Self {
        self.partition_values.insert(column.into(), value);
        self
    }

    /// Build the matching remove action for this file.
    pub fn to_remove(&self, deletion_timestamp: DateTime<Utc>) -> RemoveFile {
        RemoveFile {
            path: self.path.clone(),
            deletion_timestamp: Some(deletion_timestamp.timestamp_millis()),
            data_change: true,
            extended_file_metadata: Some(true),
            partition_values: Some(self.partition_values.clone()),
            size: Some(self.size),
        }
    }
}

/// Removes a data file (by path) from the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    /// Path of the removed file relative to the table root.
    pub path: String,
    /// When the removal happened, in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    /// Whether this remove changes the logical content of the table.
    pub data_change: bool,
    /// Whether `partition_values` and `size` are populated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_file_metadata: Option<bool>,
    /// Partition values of the removed file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<BTreeMap<String, Option<String>>>,
    /// Size of the removed file in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl RemoveFile {
    /// A data-changing remove of `path`, stamped with the current time.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            deletion_timestamp: Some(Utc::now().timestamp_millis()),
            data_change: true,
            extended_file_metadata: None,
            partition_values: None,
            size: None,
        }
    }
}

/// Storage format descriptor for data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Name of the file format, e.g. `parquet`.
    pub provider: String,
    /// Format-specific options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: BTreeMap::new(),
        }
    }
}

/// Table-level metadata. A commit carrying this replaces the previous value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Unique table identifier.
    pub id: String,
    /// User-facing name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User-facing description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data file format.
    #[serde(default)]
    pub format: Format,
    /// Serialized table schema. Opaque to the log.
    pub schema_string: String,
    /// Columns the table is partitioned by.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Table properties (including recognized `delta.*` options).
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    /// Creation time in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

impl Metadata {
    /// New metadata with a random id, the given schema and partition columns.
    pub fn new(schema_string: impl Into<String>, partition_columns: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            description: None,
            format: Format::default(),
            schema_string: schema_string.into(),
            partition_columns,
            configuration: BTreeMap::new(),
            created_time: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Builder-style table property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }
}

/// Minimum reader/writer protocol versions required by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Minimum reader version.
    pub min_reader_version: i32,
    /// Minimum writer version.
    pub min_writer_version: i32,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            min_reader_version: 1,
            min_writer_version: 2,
        }
    }
}

/// Isolation level a commit was made under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Concurrent data additions conflict with transactions that read the table.
    Serializable,
    /// Only concurrent writes that touch the same files conflict.
    #[default]
    WriteSerializable,
    /// Reads see a snapshot; no read tracking at all.
    SnapshotIsolation,
    /// A level written by a newer writer that this reader does not know.
    /// Only ever produced when decoding commits.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IsolationLevel::Serializable => "Serializable",
            IsolationLevel::WriteSerializable => "WriteSerializable",
            IsolationLevel::SnapshotIsolation => "SnapshotIsolation",
            IsolationLevel::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Serializable" => Ok(IsolationLevel::Serializable),
            "WriteSerializable" => Ok(IsolationLevel::WriteSerializable),
            "SnapshotIsolation" => Ok(IsolationLevel::SnapshotIsolation),
            other => Err(format!("unknown isolation level '{other}'")),
        }
    }
}

/// Provenance recorded with a commit.
///
/// All fields are optional: legacy commits may have none of them, and newer
/// fields such as `operationMetrics` are absent from older records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Wall-clock commit time in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Operation name, e.g. `WRITE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Stringified operation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_parameters: Option<BTreeMap<String, String>>,
    /// Version the committing transaction last reconciled against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<u64>,
    /// Isolation level of the committing transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    /// Whether the commit only appended data without reading the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_blind_append: Option<bool>,
    /// Stringified operation metrics (file, row and byte counts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_metrics: Option<BTreeMap<String, String>>,
    /// Caller-supplied free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<String>,
}

impl CommitInfo {
    /// Commit timestamp as a UTC datetime, if recorded and in range.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

/// Outcome of decoding one NDJSON line.
pub(crate) enum DecodedLine {
    Action(Box<Action>),
    Skipped,
}

/// Decode one line of a commit or checkpoint file.
///
/// Blank lines and lines tagged with an action type this crate does not model
/// are skipped; anything else that fails to parse is an error.
pub(crate) fn decode_line(line: &str) -> Result<DecodedLine, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(DecodedLine::Skipped);
    }

    match serde_json::from_str::<Action>(trimmed) {
        Ok(action) => Ok(DecodedLine::Action(Box::new(action))),
        Err(err) => {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            match value.as_object() {
                Some(obj) if obj.len() == 1 && !is_known_action_key(obj) => {
                    if let Some(key) = obj.keys().next() {
                        if !KNOWN_FOREIGN_ACTIONS.contains(&key.as_str()) {
                            log::debug!("skipping unknown action type '{key}'");
                        }
                    }
                    Ok(DecodedLine::Skipped)
                }
                _ => Err(err),
            }
        }
    }
}

fn is_known_action_key(obj: &serde_json::Map<String, serde_json::Value>) -> bool {
    ["add", "remove", "metaData", "protocol", "commitInfo"]
        .iter()
        .any(|k| obj.contains_key(*k))
}

/// Decode a whole NDJSON document into actions, in file order.
pub(crate) fn decode_actions(contents: &str) -> Result<Vec<Action>, serde_json::Error> {
    let mut out = Vec::new();
    for line in contents.lines() {
        if let DecodedLine::Action(action) = decode_line(line)? {
            out.push(*action);
        }
    }
    Ok(out)
}

/// Encode actions as NDJSON, one action per line, trailing newline included.
pub(crate) fn encode_actions(actions: &[Action]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(actions.len() * 128);
    for action in actions {
        serde_json::to_writer(&mut buf, action)?;
        buf.push(b'\n');
    }
    Ok(buf)
}
