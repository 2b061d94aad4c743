//! Core engine for an append-only table transaction log.
//!
//! This crate turns a directory of immutable data files into a versioned
//! table with ACID commits:
//!
//! - A Delta-style, append-only commit log under `_delta_log/`, written with
//!   create-if-absent semantics and optimistic concurrency control
//!   (`transaction_log` module).
//! - Snapshots rebuilt from the newest usable checkpoint plus the commits
//!   after it, with a bounded per-handle cache.
//! - Checkpoints, retention-driven log cleanup, and a commit history query.
//! - A `LogTable` handle that ties configuration, snapshots and transactions
//!   together for one table root (`table` module).
//! - Filesystem primitives for the on-disk layout (`storage` module).
//!
//! Data files themselves are opaque: the log only records their paths, sizes
//! and partition values.
#![deny(missing_docs)]
pub mod config;
pub mod storage;
pub mod table;
pub mod transaction_log;

pub use config::{CalendarInterval, LogConfig};
pub use table::{LogTable, TableError};
