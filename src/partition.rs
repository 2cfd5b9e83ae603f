//! Partition keys and their directory names.
//!
//! A partition key is the floor of a row timestamp (in microseconds since
//! the epoch, UTC) under the configured partition unit. Keys double as the
//! sort order of partitions; directory names are derived from them.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Time unit partitions are keyed by.
///
/// There is deliberately no "none" unit: an unpartitioned bulk load has
/// no use for the index-merge machinery of this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PartitionBy {
    Hour,
    Day,
    Month,
    Year,
}

impl PartitionBy {
    /// Floors a timestamp to its partition key.
    ///
    /// Hours and days are fixed-length in UTC so those floors are pure
    /// arithmetic; months and years go through the calendar. Returns
    /// `None` for timestamps outside the representable datetime range.
    pub fn floor(self, micros: i64) -> Option<i64> {
        match self {
            PartitionBy::Hour => Some(micros.div_euclid(MICROS_PER_HOUR) * MICROS_PER_HOUR),
            PartitionBy::Day => Some(micros.div_euclid(MICROS_PER_DAY) * MICROS_PER_DAY),
            PartitionBy::Month => {
                let dt = to_datetime(micros)?;
                let first = NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)?;
                Some(first.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros())
            }
            PartitionBy::Year => {
                let dt = to_datetime(micros)?;
                let first = NaiveDate::from_ymd_opt(dt.year(), 1, 1)?;
                Some(first.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros())
            }
        }
    }

    /// Directory name of the partition with the given key.
    ///
    /// The name is unambiguous per unit: `2020-01-01T13` for hours,
    /// `2020-01-01` for days, `2020-01` for months, `2020` for years.
    pub fn dir_name(self, key: i64) -> String {
        // Keys come from `floor`, which already proved the datetime valid.
        let dt = match to_datetime(key) {
            Some(dt) => dt,
            None => return format!("invalid-{}", key),
        };
        match self {
            PartitionBy::Hour => dt.format("%Y-%m-%dT%H").to_string(),
            PartitionBy::Day => dt.format("%Y-%m-%d").to_string(),
            PartitionBy::Month => dt.format("%Y-%m").to_string(),
            PartitionBy::Year => dt.format("%Y").to_string(),
        }
    }
}

fn to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single()
}
