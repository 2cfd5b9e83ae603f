//! Symbol reconciliation phase.
//!
//! Every worker interned symbols into its own staging dictionary, so the
//! same string may carry a different key in every staging table. This
//! phase folds the staging dictionaries into the final table's
//! dictionaries (serially, in worker order) and rewrites the staged key
//! columns in place through the resulting remaps.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::debug;
use memmap2::MmapMut;

use crate::schema::ColumnType;
use crate::table::symbol::SymbolTable;
use crate::table::{key_file, remap_file, symbol_file, Table, NULL_KEY};

/// One staged key column to rewrite: `new = remap[old]`.
pub(crate) struct RewriteJob {
    pub key_file: PathBuf,
    pub remap: Arc<Vec<i32>>,
}

/// Merges every staging dictionary into the final table's dictionaries,
/// persists a remap next to each staged key column and returns the
/// rewrite jobs for the parallel key-update pass.
///
/// `staging_roots` and `distribution` run in worker order; within one
/// worker, values merge in dictionary insertion order. Deterministic,
/// though not canonical.
pub(crate) fn merge_symbols(
    final_table: &mut Table,
    staging_roots: &[PathBuf],
    distribution: &[Vec<String>],
) -> crate::Result<Vec<RewriteJob>> {
    let columns: Vec<(usize, String)> = final_table
        .schema()
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.ty == ColumnType::Symbol)
        .map(|(i, c)| (i, c.name.clone()))
        .collect();

    let mut jobs = Vec::new();
    for (column, name) in &columns {
        for (worker, root) in staging_roots.iter().enumerate() {
            let staged = SymbolTable::load(&symbol_file(root, name))?;
            if staged.len() == 0 {
                continue;
            }
            let final_dict = match final_table.symbol_table_mut(*column) {
                Some(dict) => dict,
                None => continue,
            };
            let remap: Vec<i32> = staged
                .values()
                .iter()
                .map(|value| final_dict.intern(value))
                .collect();
            debug!(
                "symbol column '{}': worker {} adds {} values, final dictionary at {}",
                name,
                worker,
                staged.len(),
                final_dict.len()
            );
            let remap = Arc::new(remap);
            for partition in &distribution[worker] {
                let dir = root.join(partition);
                write_remap(&remap_file(&dir, name), &remap)?;
                jobs.push(RewriteJob {
                    key_file: key_file(&dir, name),
                    remap: Arc::clone(&remap),
                });
            }
        }
    }
    Ok(jobs)
}

fn write_remap(path: &Path, remap: &[i32]) -> crate::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for &key in remap {
        out.write_i32::<LittleEndian>(key)?;
    }
    out.flush()?;
    Ok(())
}

/// Rewrites one staged key column in place through its remap.
pub(crate) fn rewrite_keys(job: &RewriteJob) -> crate::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&job.key_file)?;
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    for chunk in map.chunks_exact_mut(4) {
        let old = LittleEndian::read_i32(chunk);
        if old != NULL_KEY {
            let new = job
                .remap
                .get(old as usize)
                .copied()
                .unwrap_or(NULL_KEY);
            LittleEndian::write_i32(chunk, new);
        }
    }
    map.flush()?;
    Ok(())
}
