//! Load phase: merge a partition's index shards and import its rows.
//!
//! The merged index is walked in timestamp order; each entry's record is
//! re-read from the source as a `max_line_len` slab, lexed and appended
//! to the worker's staging table. The slab size is the maximum record
//! length measured while indexing, so a record that fails to terminate
//! inside its slab is a broken invariant, not a quiet truncation.

use std::path::Path;

use csv_core::{ReadRecordResult, Reader, ReaderBuilder};
use log::debug;

use crate::boundary::record_end;
use crate::config::Atomicity;
use crate::errors::LoadError;
use crate::index::{merge_partition_index, MergedIndex};
use crate::schema::{Schema, TimestampParser};
use crate::table::{FieldError, Table};

/// Shared, immutable inputs of every partition-import task.
pub(crate) struct LoaderContext<'a> {
    pub source: &'a [u8],
    pub delimiter: u8,
    pub schema: &'a Schema,
    pub ts_parser: &'a TimestampParser,
    pub atomicity: Atomicity,
    pub max_line_len: usize,
    /// `workRoot/{table}`, parent of all partition shard directories.
    pub work_dir: &'a Path,
}

/// Row accounting of one imported partition.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct LoadStats {
    pub rows_loaded: u64,
    pub rows_rejected: u64,
    pub fields_nulled: u64,
}

impl LoadStats {
    pub fn add(&mut self, other: LoadStats) {
        self.rows_loaded += other.rows_loaded;
        self.rows_rejected += other.rows_rejected;
        self.fields_nulled += other.fields_nulled;
    }
}

/// Scratch owned by one worker for the whole load phase.
pub(crate) struct LoaderScratch {
    lexer: Reader,
    output: Vec<u8>,
    ends: Vec<usize>,
    tail: Vec<u8>,
}

impl LoaderScratch {
    pub fn new(ctx: &LoaderContext<'_>) -> Self {
        Self {
            lexer: ReaderBuilder::new().delimiter(ctx.delimiter).build(),
            output: vec![0u8; (ctx.max_line_len + 64).max(1024)],
            ends: vec![0usize; ctx.schema.column_count() + 8],
            tail: Vec::new(),
        }
    }
}

/// Imports one partition into `staging`: builds the merged index, then
/// streams it against the source.
pub(crate) fn load_partition(
    ctx: &LoaderContext<'_>,
    scratch: &mut LoaderScratch,
    staging: &mut Table,
    partition: &str,
) -> crate::Result<LoadStats> {
    let partition_dir = ctx.work_dir.join(partition);
    let (merged_path, entry_count) = merge_partition_index(&partition_dir)?;
    let index = MergedIndex::open(&merged_path)?;
    debug_assert_eq!(index.len() as u64, entry_count);

    let mut writer = staging.begin_partition(partition, ctx.ts_parser)?;
    let mut stats = LoadStats::default();
    let ts_index = ctx.schema.timestamp_index();
    let column_count = ctx.schema.column_count();

    for i in 0..index.len() {
        let entry = index.get(i);
        let offset = entry.offset as usize;
        let slab_end = (offset + ctx.max_line_len).min(ctx.source.len());
        let slab = &ctx.source[offset..slab_end];

        let record = match record_end(slab) {
            Some(end) => &slab[..end],
            None if slab_end == ctx.source.len() => {
                // Final record of the file without a trailing newline;
                // give the lexer the terminator it expects.
                scratch.tail.clear();
                scratch.tail.extend_from_slice(slab);
                scratch.tail.push(b'\n');
                &scratch.tail[..]
            }
            None => {
                return Err(LoadError::RecordTooLong {
                    offset: entry.offset as u64,
                    max_line_len: ctx.max_line_len,
                })
            }
        };

        let field_count = loop {
            scratch.lexer.reset();
            let (result, _, nout, nend) =
                scratch
                    .lexer
                    .read_record(record, &mut scratch.output, &mut scratch.ends);
            match result {
                ReadRecordResult::Record => {
                    debug_assert!(nout <= scratch.output.len());
                    break nend;
                }
                ReadRecordResult::OutputFull => {
                    let grown = scratch.output.len() * 2;
                    scratch.output.resize(grown, 0);
                }
                ReadRecordResult::OutputEndsFull => {
                    let grown = scratch.ends.len() * 2;
                    scratch.ends.resize(grown, 0);
                }
                ReadRecordResult::InputEmpty | ReadRecordResult::End => {
                    return Err(LoadError::RecordTooLong {
                        offset: entry.offset as u64,
                        max_line_len: ctx.max_line_len,
                    })
                }
            }
        };

        let mut row = writer.new_row(entry.timestamp);
        let mut rejected_column = None;
        for column in 0..column_count {
            if column == ts_index {
                continue;
            }
            let bytes = if column < field_count {
                let start = if column == 0 {
                    0
                } else {
                    scratch.ends[column - 1]
                };
                &scratch.output[start..scratch.ends[column]]
            } else {
                &[]
            };
            if let Err(FieldError { column }) = row.put(column, bytes) {
                match ctx.atomicity {
                    Atomicity::SkipColumn => {
                        row.put_null(column);
                        stats.fields_nulled += 1;
                    }
                    Atomicity::SkipRow => {
                        rejected_column = Some(column);
                        break;
                    }
                    Atomicity::SkipAll => {
                        row.cancel();
                        return Err(LoadError::PartitionAborted {
                            partition: partition.to_string(),
                            column: ctx.schema.columns()[column].name.clone(),
                        });
                    }
                }
            }
        }
        match rejected_column {
            Some(column) => {
                row.cancel();
                stats.rows_rejected += 1;
                debug!(
                    "partition {}: row at offset {} rejected on column '{}'",
                    partition, entry.offset, ctx.schema.columns()[column].name
                );
            }
            None => {
                row.append()?;
                stats.rows_loaded += 1;
            }
        }
    }

    writer.commit(true)?;
    debug!(
        "partition {}: {} rows loaded, {} rejected",
        partition, stats.rows_loaded, stats.rows_rejected
    );
    Ok(stats)
}
