//! Chunk boundary detection for unsynchronized parallel scans.
//!
//! The source file is cut into byte ranges without regard for record
//! structure, so a range may start in the middle of a record or even
//! inside a quoted field containing literal newlines. Each range is
//! scanned once ([`scan`]), producing newline statistics under both
//! quote-parity hypotheses; a serial pass ([`reconcile`]) then resolves
//! the real parity at every cut and produces record-aligned chunk
//! boundaries.

use memchr::memchr2_iter;

/// Newline statistics of one scanned byte range.
///
/// `first_newline_*` are offsets relative to the range start, −1 when the
/// range holds no newline under that hypothesis.
#[derive(Debug, Copy, Clone, Default)]
pub struct ChunkStat {
    /// Count of `"` bytes in the range.
    pub quotes: u64,
    /// Newlines outside quotes assuming the range starts outside a quoted field.
    pub newlines_even: u64,
    /// Newlines outside quotes assuming the range starts inside a quoted field.
    pub newlines_odd: u64,
    pub first_newline_even: i64,
    pub first_newline_odd: i64,
}

/// A record-aligned chunk: byte offset of its first record and the
/// 0-based line number that record starts on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkBoundary {
    pub offset: u64,
    pub line: u64,
}

/// Scans one byte range and counts quotes and hypothesis newlines.
///
/// A quote toggles parity; a newline is attributed to the hypothesis
/// under which the scanner currently sits outside quotes. Content can
/// never make this fail.
pub fn scan(bytes: &[u8]) -> ChunkStat {
    let mut stat = ChunkStat {
        first_newline_even: -1,
        first_newline_odd: -1,
        ..ChunkStat::default()
    };
    for pos in memchr2_iter(b'"', b'\n', bytes) {
        if bytes[pos] == b'"' {
            stat.quotes += 1;
        } else if stat.quotes % 2 == 0 {
            stat.newlines_even += 1;
            if stat.first_newline_even < 0 {
                stat.first_newline_even = pos as i64;
            }
        } else {
            stat.newlines_odd += 1;
            if stat.first_newline_odd < 0 {
                stat.first_newline_odd = pos as i64;
            }
        }
    }
    stat
}

/// Combines per-range stats into file-wide chunk boundaries.
///
/// `starts[i]` is the byte offset range `i` was scanned from; `stats`
/// and `starts` run in file order. The first chunk is assumed to start
/// outside quotes at offset 0. A range with no newline under the
/// resolved hypothesis (one huge quoted field, or one over-long line)
/// is merged into its predecessor. The returned sequence always ends
/// with the synthetic terminator at `file_len`.
pub fn reconcile(stats: &[ChunkStat], starts: &[u64], file_len: u64) -> Vec<ChunkBoundary> {
    debug_assert_eq!(stats.len(), starts.len());

    let mut boundaries = vec![ChunkBoundary { offset: 0, line: 0 }];
    if stats.is_empty() {
        boundaries.push(ChunkBoundary {
            offset: file_len,
            line: 0,
        });
        return boundaries;
    }

    let mut quotes_total = stats[0].quotes;
    // One past the newline that terminates the record a boundary points at,
    // carried for every later boundary uniformly.
    let mut lines_total = stats[0].newlines_even + 1;

    for i in 1..stats.len() {
        let (first_newline, newlines) = if quotes_total % 2 == 1 {
            (stats[i].first_newline_odd, stats[i].newlines_odd)
        } else {
            (stats[i].first_newline_even, stats[i].newlines_even)
        };
        if first_newline >= 0 {
            boundaries.push(ChunkBoundary {
                offset: starts[i] + first_newline as u64 + 1,
                line: lines_total,
            });
        }
        lines_total += newlines;
        quotes_total += stats[i].quotes;
    }

    if boundaries
        .last()
        .map(|b| b.offset < file_len)
        .unwrap_or(true)
    {
        boundaries.push(ChunkBoundary {
            offset: file_len,
            line: lines_total,
        });
    }
    boundaries
}

/// Splits `[0, len)` into scan ranges of at least `min_chunk_size` bytes,
/// aiming for one range per worker.
pub(crate) fn scan_ranges(len: u64, min_chunk_size: u64, workers: usize) -> Vec<(u64, u64)> {
    let chunk = (len / workers.max(1) as u64).max(min_chunk_size).max(1);
    let mut ranges = Vec::new();
    let mut lo = 0;
    while lo < len {
        let hi = (lo + chunk).min(len);
        ranges.push((lo, hi));
        lo = hi;
    }
    ranges
}

/// Offset one past the end of the first record in `slab`, i.e. one past
/// its terminating newline, assuming `slab` starts outside quotes.
/// `None` when the record does not terminate inside the slab.
pub(crate) fn record_end(slab: &[u8]) -> Option<usize> {
    let mut quotes = 0u64;
    for pos in memchr2_iter(b'"', b'\n', slab) {
        if slab[pos] == b'"' {
            quotes += 1;
        } else if quotes % 2 == 0 {
            return Some(pos + 1);
        }
    }
    None
}
