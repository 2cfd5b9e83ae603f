//! Timestamp index shards and their k-way merge.
//!
//! While indexing, every worker appends `(timestamp, offset)` entries for
//! the records it scans into one shard file per partition it touches.
//! Shards are sorted before they are sealed, so the merge phase can treat
//! each as an ascending run and produce the partition's single merged
//! index with a heap of run heads.

use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;

/// Bytes of one packed `(i64 timestamp, i64 offset)` entry.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Name of a partition's merged index file, distinct from every
/// `{worker}_{chunk}` shard name.
pub(crate) const MERGED_INDEX_FILE: &str = "__index";

/// One record of the source file: its timestamp in epoch microseconds
/// and the byte offset it starts at.
///
/// The derived ordering (timestamp first, offset as the tie-breaker) is
/// the sort order of shards and of the merged index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub offset: i64,
}

impl IndexEntry {
    #[inline]
    pub(crate) fn read_at(buf: &[u8], index: usize) -> Self {
        let base = index * INDEX_ENTRY_SIZE;
        IndexEntry {
            timestamp: LittleEndian::read_i64(&buf[base..base + 8]),
            offset: LittleEndian::read_i64(&buf[base + 8..base + 16]),
        }
    }
}

/// Sorts `entries` and appends them to the shard at `path`.
///
/// Each `(partition, chunk)` pair is written by exactly one worker, so
/// append is unsynchronized.
pub(crate) fn append_shard(path: &Path, entries: &mut Vec<IndexEntry>) -> crate::Result<()> {
    entries.sort_unstable();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    for entry in entries.iter() {
        out.write_i64::<LittleEndian>(entry.timestamp)?;
        out.write_i64::<LittleEndian>(entry.offset)?;
    }
    out.flush()?;
    Ok(())
}

/// A memory-mapped ascending run of index entries.
struct Run {
    map: Mmap,
    pos: usize,
}

impl Run {
    fn len(&self) -> usize {
        self.map.len() / INDEX_ENTRY_SIZE
    }

    fn next(&mut self) -> Option<IndexEntry> {
        if self.pos < self.len() {
            let entry = IndexEntry::read_at(&self.map, self.pos);
            self.pos += 1;
            Some(entry)
        } else {
            None
        }
    }
}

/// Heap item carrying the run a head entry came from. Reversed ordering
/// turns the std max-heap into a min-heap; the run index keeps equal
/// entries in run order.
struct RunHead {
    entry: IndexEntry,
    run: usize,
}

impl Ord for RunHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.entry, self.run).cmp(&(other.entry, other.run)).reverse()
    }
}

impl PartialOrd for RunHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RunHead {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && self.run == other.run
    }
}

impl Eq for RunHead {}

/// Merges every shard of `partition_dir` into its `__index` file and
/// returns the merged path and the number of entries.
///
/// Shards are enumerated in `(worker, chunk)` order so ties decay
/// deterministically even between entries with equal offsets (which a
/// well-formed index never contains).
pub(crate) fn merge_partition_index(partition_dir: &Path) -> crate::Result<(PathBuf, u64)> {
    let mut shard_paths = Vec::new();
    for dir_entry in std::fs::read_dir(partition_dir)? {
        let dir_entry = dir_entry?;
        if let Some(key) = shard_sort_key(&dir_entry.file_name().to_string_lossy()) {
            shard_paths.push((key, dir_entry.path()));
        }
    }
    shard_paths.sort_unstable_by_key(|(key, _)| *key);

    let mut runs = Vec::with_capacity(shard_paths.len());
    for (_, path) in &shard_paths {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            continue;
        }
        let map = unsafe { Mmap::map(&file)? };
        debug_assert_eq!(map.len() % INDEX_ENTRY_SIZE, 0);
        runs.push(Run { map, pos: 0 });
    }

    let merged_path = partition_dir.join(MERGED_INDEX_FILE);
    let mut out = BufWriter::new(File::create(&merged_path)?);
    let mut heap = BinaryHeap::with_capacity(runs.len());
    for (run, state) in runs.iter_mut().enumerate() {
        if let Some(entry) = state.next() {
            heap.push(RunHead { entry, run });
        }
    }

    let mut count = 0u64;
    while let Some(RunHead { entry, run }) = heap.pop() {
        out.write_i64::<LittleEndian>(entry.timestamp)?;
        out.write_i64::<LittleEndian>(entry.offset)?;
        count += 1;
        if let Some(next) = runs[run].next() {
            debug_assert!(next >= entry, "shard {} is not sorted", run);
            heap.push(RunHead { entry: next, run });
        }
    }
    out.flush()?;
    Ok((merged_path, count))
}

fn shard_sort_key(name: &str) -> Option<(usize, usize)> {
    let mut parts = name.splitn(2, '_');
    let worker = parts.next()?.parse().ok()?;
    let chunk = parts.next()?.parse().ok()?;
    Some((worker, chunk))
}

/// Read-only view over a partition's merged index.
pub(crate) struct MergedIndex {
    map: Mmap,
}

impl MergedIndex {
    pub fn open(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len() / INDEX_ENTRY_SIZE
    }

    pub fn get(&self, index: usize) -> IndexEntry {
        IndexEntry::read_at(&self.map, index)
    }
}
