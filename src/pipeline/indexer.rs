//! Indexing phase: one task per record-aligned chunk.
//!
//! Each task lexes its byte range, extracts the designated timestamp of
//! every record and buffers `(timestamp, offset)` entries per partition
//! key; buffers are sorted and appended to that partition's shard file
//! when the chunk completes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use csv::ByteRecord;
use log::{debug, warn};

use crate::index::{append_shard, IndexEntry};
use crate::partition::PartitionBy;
use crate::schema::{Schema, TimestampParser};

/// Shared, immutable inputs of every indexing task.
pub(crate) struct IndexerContext<'a> {
    pub source: &'a [u8],
    pub delimiter: u8,
    pub schema: &'a Schema,
    pub ts_parser: &'a TimestampParser,
    pub partition_by: PartitionBy,
    /// `workRoot/{table}`, parent of all partition shard directories.
    pub work_dir: &'a Path,
}

/// What one indexing task learned about its chunk.
pub(crate) struct IndexChunkResult {
    pub partition_keys: HashSet<i64>,
    pub max_line_len: usize,
    pub records_indexed: u64,
    pub timestamp_errors: u64,
}

/// Indexes the chunk `[lo, hi)` which starts at `starting_line` of the
/// file. The chunk id makes shard file names unique; the worker id only
/// brands them.
pub(crate) fn index_chunk(
    ctx: &IndexerContext<'_>,
    lo: u64,
    hi: u64,
    starting_line: u64,
    chunk_id: usize,
) -> crate::Result<IndexChunkResult> {
    let worker_id = rayon::current_thread_index().unwrap_or(0);
    let slice = &ctx.source[lo as usize..hi as usize];
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(ctx.delimiter)
        .from_reader(slice);

    let ts_index = ctx.schema.timestamp_index();
    let mut skip_header = ctx.schema.has_header() && lo == 0;
    let mut buffers: HashMap<i64, Vec<IndexEntry>> = HashMap::new();
    let mut record = ByteRecord::new();
    let mut result = IndexChunkResult {
        partition_keys: HashSet::new(),
        max_line_len: 0,
        records_indexed: 0,
        timestamp_errors: 0,
    };
    let mut records_seen = 0u64;

    loop {
        let start = reader.position().byte();
        if !reader.read_byte_record(&mut record)? {
            break;
        }
        let record_len = (reader.position().byte() - start) as usize;
        result.max_line_len = result.max_line_len.max(record_len);
        records_seen += 1;

        if skip_header {
            skip_header = false;
            continue;
        }

        let timestamp = record.get(ts_index).and_then(|v| ctx.ts_parser.parse(v));
        let key = timestamp.and_then(|ts| ctx.partition_by.floor(ts));
        match (timestamp, key) {
            (Some(ts), Some(key)) => {
                buffers.entry(key).or_insert_with(Vec::new).push(IndexEntry {
                    timestamp: ts,
                    offset: (lo + start) as i64,
                });
                result.records_indexed += 1;
            }
            _ => {
                result.timestamp_errors += 1;
                warn!(
                    "line {}: unparseable timestamp, record skipped",
                    starting_line + records_seen
                );
            }
        }
    }

    for (key, mut entries) in buffers {
        let partition_dir = ctx.work_dir.join(ctx.partition_by.dir_name(key));
        std::fs::create_dir_all(&partition_dir)?;
        let shard = partition_dir.join(format!("{}_{}", worker_id, chunk_id));
        append_shard(&shard, &mut entries)?;
        result.partition_keys.insert(key);
    }
    debug!(
        "chunk {} [{}, {}): {} records, {} partitions",
        chunk_id,
        lo,
        hi,
        result.records_indexed,
        result.partition_keys.len()
    );
    Ok(result)
}
