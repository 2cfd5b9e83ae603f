//! Parallel bulk loader of delimited text into time-partitioned
//! columnar tables.
//!
//! [`Loader`] ingests one large, timestamp-unordered CSV-like file into
//! a table partitioned by hour, day, month or year, using a fixed pool
//! of workers and memory-mapped i/o. The work happens in five strictly
//! ordered phases: chunk boundaries are found despite quoted embedded
//! newlines, every record's timestamp and offset are indexed into
//! per-partition shards, each partition's shards are merged and its rows
//! imported in timestamp order into per-worker staging tables, symbol
//! dictionaries are reconciled, and finally the staged partitions are
//! attached to the target table.
//!
//! # Example
//!
//! ```no_run
//! use parload::{Atomicity, Loader, LoadRequest, PartitionBy, Settings};
//!
//! # fn main() -> Result<(), parload::LoadError> {
//! let settings = Settings::new("/data/in", "/data/work", "/data/db").with_workers(4);
//! let loader = Loader::new(settings)?;
//!
//! let request = LoadRequest::builder("trades", "trades.csv")
//!     .partition_by(PartitionBy::Day)
//!     .timestamp_column("ts")
//!     .atomicity(Atomicity::SkipRow)
//!     .build()?;
//!
//! let summary = loader.load(&request)?;
//! println!(
//!     "{} rows across {} partitions",
//!     summary.rows_loaded,
//!     summary.partitions.len()
//! );
//! # Ok(())
//! # }
//! ```
//!
//! The file may be larger than memory; per-record state never exceeds
//! the longest line. A failed load removes its work directory and
//! leaves the target table without attached partitions, so the call can
//! simply be retried.

pub mod boundary;
pub mod config;
pub mod errors;
pub mod partition;
pub mod schema;
pub mod table;

pub(crate) mod index;

mod pipeline;

pub use config::{Atomicity, LoadRequest, LoadRequestBuilder, Settings};
pub use errors::LoadError;
pub use partition::PartitionBy;
pub use pipeline::{LoadSummary, Loader};
pub use schema::{Column, ColumnType, Schema};

/// Result type of this crate
pub type Result<T> = std::result::Result<T, LoadError>;
