use table_log_core::config::ParseIntervalError;
use table_log_core::storage::StorageError;
use table_log_core::table::TableError;

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid table location: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("Invalid --retention '{spec}': {source}"))]
    InvalidRetention {
        spec: String,
        source: ParseIntervalError,
    },

    #[snafu(display("Invalid --property '{spec}': expected KEY=VALUE"))]
    InvalidProperty { spec: String },

    #[snafu(display(
        "Failed to create table at {table}. \
         Ensure the directory is writable and holds no log yet."
    ))]
    CreateTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display(
        "Failed to open table at {table}. \
         Ensure it contains a _delta_log directory with protocol and metadata."
    ))]
    OpenTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Failed to read the log of {table}: {source}"))]
    ReadLog {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Checkpoint failed for table {table}: {source}"))]
    Checkpoint {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Log cleanup failed for table {table}: {source}"))]
    Cleanup {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Failed to encode output: {source}"))]
    Json { source: serde_json::Error },
}
