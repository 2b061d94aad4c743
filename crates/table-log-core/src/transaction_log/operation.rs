//! Operation descriptors recorded in `commitInfo`.
//!
//! Callers describe *what* a commit did with an [`Operation`]. The log turns it
//! into a stable operation name plus a string-to-string parameter map, which is
//! what history readers get back. List- and map-valued parameters are stored
//! as JSON strings.
use std::collections::BTreeMap;

/// How a write combines with existing table content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Add files alongside the existing ones.
    Append,
    /// Replace the existing content.
    Overwrite,
    /// Fail if the table already exists.
    ErrorIfExists,
    /// Do nothing if the table already exists.
    Ignore,
}

impl SaveMode {
    /// Name as written into operation parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveMode::Append => "Append",
            SaveMode::Overwrite => "Overwrite",
            SaveMode::ErrorIfExists => "ErrorIfExists",
            SaveMode::Ignore => "Ignore",
        }
    }
}

/// A table-level operation, as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Table creation.
    Create {
        /// Save mode the table was created with.
        mode: SaveMode,
        /// Table location, when known.
        location: Option<String>,
        /// Partition columns.
        partition_by: Vec<String>,
        /// Initial table properties.
        properties: BTreeMap<String, String>,
    },
    /// A data write.
    Write {
        /// Append or overwrite.
        mode: SaveMode,
        /// Partition columns, if the writer specified them.
        partition_by: Option<Vec<String>>,
        /// Replace-where predicate for selective overwrites.
        predicate: Option<String>,
    },
    /// Row deletion by predicate (`None` deletes everything).
    Delete {
        /// Deletion predicate.
        predicate: Option<String>,
    },
    /// Row update by predicate.
    Update {
        /// Update predicate.
        predicate: Option<String>,
    },
    /// Merge of a source into the table.
    Merge {
        /// Merge join predicate.
        predicate: String,
    },
    /// File compaction.
    Optimize {
        /// Partition filter, if any.
        predicate: Option<String>,
        /// Target file size in bytes.
        target_size: Option<u64>,
    },
    /// Table property change.
    SetTableProperties {
        /// Properties that were set.
        properties: BTreeMap<String, String>,
    },
    /// Anything else; the name and parameters are taken verbatim.
    Custom {
        /// Operation name.
        name: String,
        /// Operation parameters.
        parameters: BTreeMap<String, String>,
    },
}

impl Operation {
    /// Convenience constructor for an append.
    pub fn append() -> Self {
        Operation::Write {
            mode: SaveMode::Append,
            partition_by: None,
            predicate: None,
        }
    }

    /// Convenience constructor for a full overwrite.
    pub fn overwrite() -> Self {
        Operation::Write {
            mode: SaveMode::Overwrite,
            partition_by: None,
            predicate: None,
        }
    }

    /// Stable operation name written into `commitInfo.operation`.
    pub fn name(&self) -> &str {
        match self {
            Operation::Create { .. } => "CREATE TABLE",
            Operation::Write { .. } => "WRITE",
            Operation::Delete { .. } => "DELETE",
            Operation::Update { .. } => "UPDATE",
            Operation::Merge { .. } => "MERGE",
            Operation::Optimize { .. } => "OPTIMIZE",
            Operation::SetTableProperties { .. } => "SET TBLPROPERTIES",
            Operation::Custom { name, .. } => name,
        }
    }

    /// Stringified parameters written into `commitInfo.operationParameters`.
    pub fn parameters(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        match self {
            Operation::Create {
                mode,
                location,
                partition_by,
                properties,
            } => {
                params.insert("mode".into(), mode.as_str().into());
                if let Some(location) = location {
                    params.insert("location".into(), location.clone());
                }
                params.insert("partitionBy".into(), json_list(partition_by));
                params.insert("properties".into(), json_map(properties));
            }
            Operation::Write {
                mode,
                partition_by,
                predicate,
            } => {
                params.insert("mode".into(), mode.as_str().into());
                if let Some(cols) = partition_by {
                    params.insert("partitionBy".into(), json_list(cols));
                }
                if let Some(p) = predicate {
                    params.insert("predicate".into(), normalize_predicate(p));
                }
            }
            Operation::Delete { predicate } | Operation::Update { predicate } => {
                if let Some(p) = predicate {
                    params.insert("predicate".into(), normalize_predicate(p));
                }
            }
            Operation::Merge { predicate } => {
                params.insert("predicate".into(), normalize_predicate(predicate));
            }
            Operation::Optimize {
                predicate,
                target_size,
            } => {
                params.insert(
                    "predicate".into(),
                    predicate
                        .as_deref()
                        .map(normalize_predicate)
                        .unwrap_or_else(|| "[]".into()),
                );
                if let Some(size) = target_size {
                    params.insert("targetSize".into(), size.to_string());
                }
            }
            Operation::SetTableProperties { properties } => {
                params.insert("properties".into(), json_map(properties));
            }
            Operation::Custom { parameters, .. } => {
                params.extend(parameters.clone());
            }
        }
        params
    }

    /// Whether this operation, on its own, only appends data.
    pub(crate) fn is_append(&self) -> bool {
        matches!(
            self,
            Operation::Write {
                mode: SaveMode::Append,
                predicate: None,
                ..
            }
        )
    }
}

/// Collapse whitespace runs and trim, so equivalent predicates read the same.
pub fn normalize_predicate(predicate: &str) -> String {
    predicate.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn json_map(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".into())
}
