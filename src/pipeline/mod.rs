//! The five-phase parallel ingest engine.
//!
//! The [`Loader`] owns the worker pool; one [`Coordinator`] per load
//! drives the phases strictly in order (boundary scan, indexing,
//! merge & load, symbol reconciliation, attach) with a barrier between
//! each. Every phase fans its tasks out over the pool and collects
//! their `Result`s; the collect is the barrier, and the first fault in
//! task order becomes the load's error after in-flight tasks drain.
//! Because the pool steals work, the coordinating thread executes tasks
//! itself while it waits, so a single-worker pool cannot deadlock.

pub(crate) mod attach;
pub(crate) mod indexer;
pub(crate) mod loader;
pub(crate) mod symbols;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};
use memmap2::Mmap;
use rayon::prelude::*;

use crate::boundary::{self, ChunkBoundary};
use crate::config::{LoadRequest, Settings};
use crate::errors::LoadError;
use crate::schema::{self, Schema, TimestampParser};
use crate::table::Table;
use indexer::{index_chunk, IndexerContext};
use loader::{load_partition, LoadStats, LoaderContext, LoaderScratch};

/// Outcome of one completed load.
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub table_name: String,
    pub workers: usize,
    /// Records that received an index entry.
    pub rows_indexed: u64,
    /// Rows that reached the final table.
    pub rows_loaded: u64,
    /// Rows cancelled under [`Atomicity::SkipRow`](crate::Atomicity::SkipRow).
    pub rows_rejected: u64,
    /// Records dropped in the indexing phase for an unparseable timestamp.
    pub timestamp_errors: u64,
    /// Fields nulled under [`Atomicity::SkipColumn`](crate::Atomicity::SkipColumn).
    pub fields_nulled: u64,
    /// Attached partition names in ascending time order.
    pub partitions: Vec<String>,
}

/// Parallel bulk loader: a fixed worker pool plus the directory roots
/// everything happens under.
///
/// One `Loader` serves any number of sequential [`load`](Self::load)
/// calls; each call drives the five ingest phases for one file.
pub struct Loader {
    settings: Settings,
    pool: rayon::ThreadPool,
}

impl Loader {
    /// Builds the worker pool. No i/o is performed.
    pub fn new(settings: Settings) -> crate::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers)
            .thread_name(|i| format!("parload-{}", i))
            .build()
            .map_err(|e| {
                LoadError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        Ok(Self { settings, pool })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Effective worker count of the pool.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs one load to completion and returns its summary.
    ///
    /// On any error the work directory is removed and the target table
    /// is left without attached partitions, so the load can simply be
    /// retried.
    pub fn load(&self, request: &LoadRequest) -> crate::Result<LoadSummary> {
        validate_table_name(&request.table_name)?;
        let coordinator = Coordinator {
            settings: &self.settings,
            pool: &self.pool,
            request,
        };
        coordinator.run()
    }
}

fn validate_table_name(name: &str) -> crate::Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if ok {
        Ok(())
    } else {
        Err(LoadError::InvalidTableName(name.to_string()))
    }
}

/// Drives the five phases of one load.
struct Coordinator<'a> {
    settings: &'a Settings,
    pool: &'a rayon::ThreadPool,
    request: &'a LoadRequest,
}

/// What the setup step (everything before phase 1) resolves.
struct Prepared {
    delimiter: u8,
    schema: Schema,
    ts_parser: TimestampParser,
    final_table: Table,
}

/// Aggregate of the indexing phase.
struct IndexOutcome {
    /// `(key, dir name)` in ascending key order.
    partitions: Vec<(i64, String)>,
    max_line_len: usize,
    rows_indexed: u64,
    timestamp_errors: u64,
}

impl<'a> Coordinator<'a> {
    fn run(&self) -> crate::Result<LoadSummary> {
        let input_path = self.settings.input_root.join(&self.request.input_file);
        let file = File::open(&input_path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(LoadError::EmptyInput(input_path));
        }
        let map = unsafe { Mmap::map(&file)? };
        let source = &map[..];

        let prepared = self.prepare(source, &input_path)?;

        let work_dir = self.settings.work_root.join(&self.request.table_name);
        if work_dir.exists() {
            std::fs::remove_dir_all(&work_dir)?;
        }
        std::fs::create_dir_all(&work_dir)?;

        let started = Instant::now();
        info!(
            "loading {:?} into '{}' with {} workers",
            self.request.input_file,
            self.request.table_name,
            self.pool.current_num_threads()
        );
        let outcome = self.run_phases(source, prepared, &work_dir);
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove work directory {:?}: {}", work_dir, e);
            }
        }
        match &outcome {
            Ok(summary) => info!(
                "loaded {} rows into '{}' ({} partitions) in {:?}",
                summary.rows_loaded,
                summary.table_name,
                summary.partitions.len(),
                started.elapsed()
            ),
            Err(e) => warn!("load of '{}' failed: {}", self.request.table_name, e),
        }
        outcome
    }

    /// Delimiter and schema detection plus final-table validation; runs
    /// before any phase-1 task is dispatched, so every failure here is a
    /// configuration error.
    fn prepare(&self, source: &[u8], input_path: &Path) -> crate::Result<Prepared> {
        let sample_len = self.settings.sample_bytes.min(source.len());
        let truncated = sample_len < source.len();
        let sample = &source[..sample_len];

        let delimiter = match self.request.delimiter {
            Some(delimiter) => delimiter,
            None => schema::detect_delimiter(sample)?,
        };
        let ts_parser = TimestampParser::new(self.request.timestamp_format.as_deref());
        let records =
            schema::sample_records(sample, truncated, delimiter, self.settings.sample_lines)?;
        if records.is_empty() {
            return Err(LoadError::EmptyInput(input_path.to_path_buf()));
        }
        let detected = schema::detect_schema(&records, self.request, &ts_parser)?;

        let name = &self.request.table_name;
        let (schema, final_table) = if Table::exists(&self.settings.db_root, name) {
            let existing = Table::open(&self.settings.db_root, name)?;
            if !existing.partitions().is_empty() {
                return Err(LoadError::TargetTableNotEmpty(name.clone()));
            }
            if existing.schema().column_count() != detected.column_count() {
                return Err(LoadError::ColumnCountMismatch {
                    table: existing.schema().column_count(),
                    input: detected.column_count(),
                });
            }
            let schema = existing.schema().clone().with_header(detected.has_header());
            (schema, existing)
        } else {
            let table = Table::create(&self.settings.db_root, name, &detected)?;
            (detected, table)
        };

        Ok(Prepared {
            delimiter,
            schema,
            ts_parser,
            final_table,
        })
    }

    fn run_phases(
        &self,
        source: &[u8],
        prepared: Prepared,
        work_dir: &Path,
    ) -> crate::Result<LoadSummary> {
        let Prepared {
            delimiter,
            schema,
            ts_parser,
            mut final_table,
        } = prepared;
        let workers = self.pool.current_num_threads();

        let boundaries = self.phase_boundary_scan(source);
        let indexed = self.phase_index(source, &boundaries, delimiter, &schema, &ts_parser, work_dir)?;

        if indexed.partitions.is_empty() {
            info!(
                "'{}': nothing to load ({} records dropped)",
                self.request.table_name, indexed.timestamp_errors
            );
            return Ok(LoadSummary {
                table_name: self.request.table_name.clone(),
                workers,
                rows_indexed: 0,
                rows_loaded: 0,
                rows_rejected: 0,
                timestamp_errors: indexed.timestamp_errors,
                fields_nulled: 0,
                partitions: Vec::new(),
            });
        }

        let (distribution, load_stats) =
            self.phase_load(source, &indexed, delimiter, &schema, &ts_parser, work_dir)?;
        self.phase_symbols(&mut final_table, work_dir, &distribution)?;
        let attached = self.phase_attach(&mut final_table, work_dir, &distribution)?;

        Ok(LoadSummary {
            table_name: self.request.table_name.clone(),
            workers,
            rows_indexed: indexed.rows_indexed,
            rows_loaded: load_stats.rows_loaded,
            rows_rejected: load_stats.rows_rejected,
            timestamp_errors: indexed.timestamp_errors,
            fields_nulled: load_stats.fields_nulled,
            partitions: attached,
        })
    }

    /// Phase 1: stat every raw chunk in parallel, then resolve quote
    /// parity serially into record-aligned boundaries.
    fn phase_boundary_scan(&self, source: &[u8]) -> Vec<ChunkBoundary> {
        let started = Instant::now();
        let ranges = boundary::scan_ranges(
            source.len() as u64,
            self.settings.min_chunk_size,
            self.pool.current_num_threads(),
        );
        let stats: Vec<boundary::ChunkStat> = self.pool.install(|| {
            ranges
                .par_iter()
                .map(|&(lo, hi)| boundary::scan(&source[lo as usize..hi as usize]))
                .collect()
        });
        let starts: Vec<u64> = ranges.iter().map(|&(lo, _)| lo).collect();
        let boundaries = boundary::reconcile(&stats, &starts, source.len() as u64);
        info!(
            "boundary scan: {} ranges -> {} chunks in {:?}",
            ranges.len(),
            boundaries.len() - 1,
            started.elapsed()
        );
        boundaries
    }

    /// Phase 2: index every chunk in parallel and fold the results into
    /// the canonical partition list.
    fn phase_index(
        &self,
        source: &[u8],
        boundaries: &[ChunkBoundary],
        delimiter: u8,
        schema: &Schema,
        ts_parser: &TimestampParser,
        work_dir: &Path,
    ) -> crate::Result<IndexOutcome> {
        let started = Instant::now();
        let ctx = IndexerContext {
            source,
            delimiter,
            schema,
            ts_parser,
            partition_by: self.request.partition_by,
            work_dir,
        };
        let chunks: Vec<(usize, ChunkBoundary, ChunkBoundary)> = boundaries
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0].offset < pair[1].offset)
            .map(|(id, pair)| (id, pair[0], pair[1]))
            .collect();

        let results = self.pool.install(|| {
            chunks
                .par_iter()
                .map(|&(id, from, to)| index_chunk(&ctx, from.offset, to.offset, from.line, id))
                .collect::<crate::Result<Vec<_>>>()
        })?;

        let mut keys = std::collections::BTreeSet::new();
        let mut outcome = IndexOutcome {
            partitions: Vec::new(),
            max_line_len: 0,
            rows_indexed: 0,
            timestamp_errors: 0,
        };
        for result in results {
            keys.extend(result.partition_keys);
            outcome.max_line_len = outcome.max_line_len.max(result.max_line_len);
            outcome.rows_indexed += result.records_indexed;
            outcome.timestamp_errors += result.timestamp_errors;
        }
        outcome.partitions = keys
            .into_iter()
            .map(|key| (key, self.request.partition_by.dir_name(key)))
            .collect();
        info!(
            "indexing: {} records over {} partitions in {:?}",
            outcome.rows_indexed,
            outcome.partitions.len(),
            started.elapsed()
        );
        Ok(outcome)
    }

    /// Phase 3: split the partition list into contiguous per-worker
    /// slices, then merge and import each slice into its staging table.
    fn phase_load(
        &self,
        source: &[u8],
        indexed: &IndexOutcome,
        delimiter: u8,
        schema: &Schema,
        ts_parser: &TimestampParser,
        work_dir: &Path,
    ) -> crate::Result<(Vec<Vec<String>>, LoadStats)> {
        let started = Instant::now();
        let workers = self.pool.current_num_threads();
        let per_worker = (indexed.partitions.len() + workers - 1) / workers;
        let slices: Vec<Vec<String>> = indexed
            .partitions
            .chunks(per_worker)
            .map(|slice| slice.iter().map(|(_, name)| name.clone()).collect())
            .collect();

        let ctx = LoaderContext {
            source,
            delimiter,
            schema,
            ts_parser,
            atomicity: self.request.atomicity,
            max_line_len: indexed.max_line_len,
            work_dir,
        };

        let mut tasks = Vec::with_capacity(slices.len());
        for (worker, slice) in slices.iter().enumerate() {
            let staging_name = format!("{}__{}", self.request.table_name, worker);
            let staging = Table::create(work_dir, &staging_name, schema)?;
            tasks.push((staging, slice.clone()));
        }

        let stats = self.pool.install(|| {
            tasks
                .into_par_iter()
                .map(|(mut staging, partitions)| -> crate::Result<LoadStats> {
                    let mut scratch = LoaderScratch::new(&ctx);
                    let mut stats = LoadStats::default();
                    for partition in &partitions {
                        stats.add(load_partition(&ctx, &mut scratch, &mut staging, partition)?);
                    }
                    staging.write_symbols()?;
                    Ok(stats)
                })
                .collect::<crate::Result<Vec<_>>>()
        })?;

        let mut total = LoadStats::default();
        for s in stats {
            total.add(s);
        }
        info!(
            "load: {} rows into {} staging tables in {:?}",
            total.rows_loaded,
            slices.len(),
            started.elapsed()
        );
        Ok((slices, total))
    }

    /// Phase 4: reconcile staging dictionaries into the final table's
    /// and rewrite all staged key columns.
    fn phase_symbols(
        &self,
        final_table: &mut Table,
        work_dir: &Path,
        distribution: &[Vec<String>],
    ) -> crate::Result<()> {
        let started = Instant::now();
        let staging_roots: Vec<PathBuf> = (0..distribution.len())
            .map(|worker| work_dir.join(format!("{}__{}", self.request.table_name, worker)))
            .collect();
        let jobs = symbols::merge_symbols(final_table, &staging_roots, distribution)?;
        self.pool.install(|| {
            jobs.par_iter()
                .map(symbols::rewrite_keys)
                .collect::<crate::Result<Vec<_>>>()
        })?;
        final_table.write_symbols()?;
        info!(
            "symbols: {} key columns rewritten in {:?}",
            jobs.len(),
            started.elapsed()
        );
        Ok(())
    }

    /// Phase 5: move every staged partition into the final table.
    fn phase_attach(
        &self,
        final_table: &mut Table,
        work_dir: &Path,
        distribution: &[Vec<String>],
    ) -> crate::Result<Vec<String>> {
        let assignments: Vec<attach::Assignment> = distribution
            .iter()
            .enumerate()
            .flat_map(|(worker, partitions)| {
                partitions
                    .iter()
                    .map(move |partition| (partition.clone(), worker))
            })
            .collect();
        attach::attach_partitions(final_table, work_dir, &assignments)
    }
}
