//! Definitions of error related things.

use std::fmt;
use std::path::PathBuf;

/// Errors of this crate
#[derive(Debug)]
#[non_exhaustive]
pub enum LoadError {
    /// The request did not specify a partition unit
    PartitionByNotSet,
    /// The table name is empty or not usable as a directory name
    InvalidTableName(String),
    /// The input file exists but contains no data
    EmptyInput(PathBuf),
    /// No column of the input could be used as the designated timestamp
    NoTimestampColumn,
    /// The requested timestamp column does not exist in the input
    TimestampColumnNotFound(String),
    /// None of the candidate delimiters matched the sampled lines
    DelimiterNotDetected,
    /// The target table exists and its column count differs from the input
    ColumnCountMismatch { table: usize, input: usize },
    /// The target table already has attached partitions
    TargetTableNotEmpty(String),
    /// A record did not terminate within the maximum line length
    /// measured during the indexing phase
    RecordTooLong { offset: u64, max_line_len: usize },
    /// A partition import was abandoned because a field failed to convert
    /// and the load was requested with whole-load atomicity
    PartitionAborted { partition: String, column: String },
    /// The table metadata on disk could not be understood
    CorruptMeta(PathBuf),
    /// Wrapper around an io error from the std lib
    IoError(std::io::Error),
    /// Wrapper around an error from the csv lexer
    CsvError(csv::Error),
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::IoError(e)
    }
}

impl From<csv::Error> for LoadError {
    fn from(e: csv::Error) -> Self {
        LoadError::CsvError(e)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            LoadError::PartitionByNotSet => {
                write!(f, "A partition unit (hour, day, month or year) is required")
            }
            LoadError::InvalidTableName(name) => {
                write!(f, "'{}' is not a valid table name", name)
            }
            LoadError::EmptyInput(path) => write!(f, "Input file {:?} is empty", path),
            LoadError::NoTimestampColumn => {
                write!(f, "No timestamp column could be detected in the input")
            }
            LoadError::TimestampColumnNotFound(name) => {
                write!(f, "Timestamp column '{}' not found in the input", name)
            }
            LoadError::DelimiterNotDetected => write!(
                f,
                "Could not detect a column delimiter from the sampled lines"
            ),
            LoadError::ColumnCountMismatch { table, input } => write!(
                f,
                "Target table has {} columns but the input has {}",
                table, input
            ),
            LoadError::TargetTableNotEmpty(name) => {
                write!(f, "Target table '{}' already has attached partitions", name)
            }
            LoadError::RecordTooLong {
                offset,
                max_line_len,
            } => write!(
                f,
                "Record at offset {} exceeds the measured maximum line length {}",
                offset, max_line_len
            ),
            LoadError::PartitionAborted { partition, column } => write!(
                f,
                "Import of partition '{}' aborted on unconvertible value in column '{}'",
                partition, column
            ),
            LoadError::CorruptMeta(path) => write!(f, "Table metadata {:?} is corrupt", path),
            LoadError::IoError(e) => write!(f, "IoError: {}", e),
            LoadError::CsvError(e) => write!(f, "CsvError: {}", e),
        }
    }
}

impl std::error::Error for LoadError {}
