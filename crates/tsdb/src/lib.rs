//! Chronofile - Alopex single-file time series store
//!
//! This crate persists periodic numeric measurements (counters, gauges,
//! distributions) into one append-mostly file that a single writer and any
//! number of readers can share.
//!
//! # Components
//!
//! - [`TimeSeriesDatabase`]: Façade owning the file, the group index and buffered rows
//! - [`ColumnInfo`]: Named group of columns, chained from the table of contents
//! - [`DataFragment`]: Batch of rows, chained per group
//! - [`RangeLock`]: Scoped advisory byte-range lock
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_chronofile::{DatabaseConfig, TimeSeriesDatabase};
//!
//! let db = TimeSeriesDatabase::open_with_config(path, b"service=api", DatabaseConfig::default())?;
//! db.add_column_group("latency", b"", 1000, &["min", "max", "count"], &[])?;
//! db.add_column_group("errors", b"", 1000, &["count"], &[])?;
//!
//! // Rows are buffered until flushed
//! db.write(1_000, "latency", &[3, 17, 42])?;
//! db.write(1_000, "errors", &[0])?;
//! db.flush()?;
//!
//! let rows = db.read("latency", 0, 5_000)?;
//! for (ts, values) in rows.iter() {
//!     println!("{ts}: {values:?}");
//! }
//! db.close()?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod lock;

pub use config::{DatabaseConfig, SyncMode};
pub use db::TimeSeriesDatabase;
pub use error::{Result, TsdbError};
pub use format::{ColumnInfo, DataFragment, FileHeader, FormatVersion, FragmentHeader, GroupRows, TableOfContents};
pub use lock::{LockMode, RangeLock};
