use std::path::{Path, PathBuf};

use crate::storage::{StorageLocation, StorageResult};

/// Table root location with table-scoped semantics.
///
/// This wraps [`StorageLocation`] and is used when callers need to treat the
/// location as a table root (log layout, data file paths and so on). Every
/// component receives the location explicitly; nothing is process-global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocation(StorageLocation);

impl From<TableLocation> for StorageLocation {
    fn from(t: TableLocation) -> Self {
        t.0
    }
}

impl AsRef<StorageLocation> for TableLocation {
    fn as_ref(&self) -> &StorageLocation {
        &self.0
    }
}

impl std::fmt::Display for TableLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            StorageLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation(StorageLocation::Local(root.into()))
    }

    /// Parse a user-facing table location string into a TableLocation.
    /// Only local filesystem paths (optionally `file://` prefixed) are supported.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        StorageLocation::parse(spec).map(TableLocation)
    }

    /// Return the underlying StorageLocation.
    pub fn storage(&self) -> &StorageLocation {
        &self.0
    }

    /// Root directory of a local table.
    pub fn local_root(&self) -> &Path {
        match &self.0 {
            StorageLocation::Local(root) => root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    #[test]
    fn parse_accepts_plain_and_file_url_paths() -> Result<(), Box<dyn std::error::Error>> {
        let plain = TableLocation::parse("/tmp/some/table")?;
        assert_eq!(plain.local_root(), Path::new("/tmp/some/table"));

        let url = TableLocation::parse("file:///tmp/some/table")?;
        assert_eq!(url, plain);
        assert_eq!(url.to_string(), "/tmp/some/table");
        Ok(())
    }

    #[test]
    fn parse_rejects_empty_spec() {
        assert!(matches!(
            TableLocation::parse("   "),
            Err(StorageError::InvalidLocation { .. })
        ));
    }
}
