//! Loader settings and per-load request descriptions.
//!
//! [`Settings`] describe the environment a [`Loader`] runs in (directory
//! roots, worker pool size, chunking), a [`LoadRequest`] describes one file
//! to ingest. Both are built with chained builders.
//!
//! [`Loader`]: crate::Loader

use std::path::{Path, PathBuf};

use crate::errors::LoadError;
use crate::partition::PartitionBy;
use crate::schema::ColumnType;

/// Default smallest byte range handed to one boundary-scan task.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default number of records sampled for schema detection.
pub const DEFAULT_SAMPLE_LINES: usize = 1000;

/// How many bytes of the file head are inspected by the delimiter
/// and schema detectors.
pub const DEFAULT_SAMPLE_BYTES: usize = 64 * 1024;

/// What to do with a row when one of its fields fails type conversion
/// during the load phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Atomicity {
    /// Abandon the whole load on the first unconvertible field.
    SkipAll,
    /// Cancel the offending row, keep loading.
    SkipRow,
    /// Leave the offending field null, keep the row.
    SkipColumn,
}

/// Environment of a [`Loader`](crate::Loader).
#[derive(Debug, Clone)]
pub struct Settings {
    pub(crate) input_root: PathBuf,
    pub(crate) work_root: PathBuf,
    pub(crate) db_root: PathBuf,
    pub(crate) workers: usize,
    pub(crate) min_chunk_size: u64,
    pub(crate) sample_lines: usize,
    pub(crate) sample_bytes: usize,
}

impl Settings {
    /// Creates settings rooted at the given directories with defaults
    /// for everything else: one worker per logical core, 16 MiB minimum
    /// chunk size.
    pub fn new<P: AsRef<Path>>(input_root: P, work_root: P, db_root: P) -> Self {
        Self {
            input_root: input_root.as_ref().to_path_buf(),
            work_root: work_root.as_ref().to_path_buf(),
            db_root: db_root.as_ref().to_path_buf(),
            workers: 0,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            sample_lines: DEFAULT_SAMPLE_LINES,
            sample_bytes: DEFAULT_SAMPLE_BYTES,
        }
    }

    /// Sets the worker pool size, 0 meaning one worker per logical core.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the smallest byte range handed to one boundary-scan task.
    ///
    /// Smaller values create more tasks; the default suits files in the
    /// tens-of-gigabytes range.
    pub fn with_min_chunk_size(mut self, min_chunk_size: u64) -> Self {
        self.min_chunk_size = min_chunk_size.max(1);
        self
    }

    /// Sets how many records are sampled for schema detection.
    pub fn with_sample_lines(mut self, sample_lines: usize) -> Self {
        self.sample_lines = sample_lines.max(1);
        self
    }

    /// Sets how many bytes of the file head the detectors may inspect.
    pub fn with_sample_bytes(mut self, sample_bytes: usize) -> Self {
        self.sample_bytes = sample_bytes.max(64);
        self
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn db_root(&self) -> &Path {
        &self.db_root
    }
}

/// One file-to-table ingestion request.
///
/// Built with [`LoadRequest::builder`]; the partition unit is mandatory,
/// everything else has a detectable default.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub(crate) table_name: String,
    pub(crate) input_file: PathBuf,
    pub(crate) partition_by: PartitionBy,
    pub(crate) delimiter: Option<u8>,
    pub(crate) timestamp_column: Option<String>,
    pub(crate) timestamp_format: Option<String>,
    pub(crate) force_header: bool,
    pub(crate) atomicity: Atomicity,
    pub(crate) column_types: Vec<(String, ColumnType)>,
}

impl LoadRequest {
    pub fn builder<S: Into<String>, P: AsRef<Path>>(
        table_name: S,
        input_file: P,
    ) -> LoadRequestBuilder {
        LoadRequestBuilder {
            table_name: table_name.into(),
            input_file: input_file.as_ref().to_path_buf(),
            partition_by: None,
            delimiter: None,
            timestamp_column: None,
            timestamp_format: None,
            force_header: false,
            atomicity: Atomicity::SkipRow,
            column_types: Vec::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

/// Builder for [`LoadRequest`]
pub struct LoadRequestBuilder {
    table_name: String,
    input_file: PathBuf,
    partition_by: Option<PartitionBy>,
    delimiter: Option<u8>,
    timestamp_column: Option<String>,
    timestamp_format: Option<String>,
    force_header: bool,
    atomicity: Atomicity,
    column_types: Vec<(String, ColumnType)>,
}

impl LoadRequestBuilder {
    /// Sets the time unit partitions are keyed by. Mandatory.
    pub fn partition_by(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = Some(partition_by);
        self
    }

    /// Sets the field delimiter byte. When not set, the delimiter is
    /// detected from the first sampled lines.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    /// Names the designated timestamp column. When not set, the first
    /// column detected as a timestamp is designated.
    pub fn timestamp_column<S: Into<String>>(mut self, name: S) -> Self {
        self.timestamp_column = Some(name.into());
        self
    }

    /// Sets a chrono format string for timestamp fields. The default
    /// accepts RFC 3339 and plain `YYYY-MM-DDTHH:MM:SS[.f]` datetimes.
    pub fn timestamp_format<S: Into<String>>(mut self, format: S) -> Self {
        self.timestamp_format = Some(format.into());
        self
    }

    /// Treats the first line as a header regardless of what the header
    /// detector would decide.
    pub fn force_header(mut self, force_header: bool) -> Self {
        self.force_header = force_header;
        self
    }

    /// Sets the row atomicity policy applied during the load phase.
    pub fn atomicity(mut self, atomicity: Atomicity) -> Self {
        self.atomicity = atomicity;
        self
    }

    /// Overrides the detected type of the named column.
    pub fn column_type<S: Into<String>>(mut self, name: S, ty: ColumnType) -> Self {
        self.column_types.push((name.into(), ty));
        self
    }

    pub fn build(self) -> crate::Result<LoadRequest> {
        let partition_by = self.partition_by.ok_or(LoadError::PartitionByNotSet)?;
        Ok(LoadRequest {
            table_name: self.table_name,
            input_file: self.input_file,
            partition_by,
            delimiter: self.delimiter,
            timestamp_column: self.timestamp_column,
            timestamp_format: self.timestamp_format,
            force_header: self.force_header,
            atomicity: self.atomicity,
            column_types: self.column_types,
        })
    }
}
