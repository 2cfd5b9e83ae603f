//! A compact columnar table on the filesystem.
//!
//! A table is a directory: `_meta` holds the schema, `_partitions` the
//! list of attached partitions, `{column}.sym` the symbol dictionaries,
//! and each partition is a subdirectory of per-column files. Fixed-width
//! columns are packed little-endian, one value per row; strings live out
//! of line behind an offset column.
//!
//! Staging tables and the final table are the same structure; the only
//! difference is who writes them and when.

pub mod symbol;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::errors::LoadError;
use crate::schema::{parse_double, parse_long, Column, ColumnType, Schema, TimestampParser};
use symbol::SymbolTable;

pub const META_FILE: &str = "_meta";
pub const PARTITIONS_FILE: &str = "_partitions";

const META_VERSION: u32 = 1;

/// Null markers per storage class.
pub const NULL_LONG: i64 = i64::MIN;
pub const NULL_KEY: i32 = -1;
pub const NULL_STR_LEN: u32 = u32::MAX;

pub fn fixed_file(dir: &Path, column: &str) -> PathBuf {
    dir.join(format!("{}.d", column))
}

pub fn key_file(dir: &Path, column: &str) -> PathBuf {
    dir.join(format!("{}.k", column))
}

pub fn offsets_file(dir: &Path, column: &str) -> PathBuf {
    dir.join(format!("{}.x", column))
}

pub fn remap_file(dir: &Path, column: &str) -> PathBuf {
    dir.join(format!("{}.r", column))
}

pub fn symbol_file(root: &Path, column: &str) -> PathBuf {
    root.join(format!("{}.sym", column))
}

/// One table rooted at `parent/name`.
pub struct Table {
    root: PathBuf,
    name: String,
    schema: Schema,
    symbols: Vec<Option<SymbolTable>>,
    partitions: Vec<(String, u64)>,
}

impl Table {
    /// Creates the table directory and writes its metadata.
    pub fn create(parent: &Path, name: &str, schema: &Schema) -> crate::Result<Self> {
        let root = parent.join(name);
        std::fs::create_dir_all(&root)?;
        let table = Self {
            root,
            name: name.to_string(),
            schema: schema.clone(),
            symbols: empty_symbols(schema),
            partitions: Vec::new(),
        };
        table.write_meta()?;
        Ok(table)
    }

    /// Opens an existing table, loading metadata, the partition list and
    /// the symbol dictionaries.
    pub fn open(parent: &Path, name: &str) -> crate::Result<Self> {
        let root = parent.join(name);
        let schema = read_meta(&root.join(META_FILE))?;
        let partitions = read_partitions(&root.join(PARTITIONS_FILE))?;
        let mut symbols = empty_symbols(&schema);
        for (i, column) in schema.columns().iter().enumerate() {
            if column.ty == ColumnType::Symbol {
                symbols[i] = Some(SymbolTable::load(&symbol_file(&root, &column.name))?);
            }
        }
        Ok(Self {
            root,
            name: name.to_string(),
            schema,
            symbols,
            partitions,
        })
    }

    pub fn exists(parent: &Path, name: &str) -> bool {
        parent.join(name).join(META_FILE).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn partitions(&self) -> &[(String, u64)] {
        &self.partitions
    }

    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|(_, rows)| rows).sum()
    }

    pub fn partition_dir(&self, partition: &str) -> PathBuf {
        self.root.join(partition)
    }

    pub fn symbol_table(&self, column: usize) -> Option<&SymbolTable> {
        self.symbols.get(column).and_then(Option::as_ref)
    }

    pub fn symbol_table_mut(&mut self, column: usize) -> Option<&mut SymbolTable> {
        self.symbols.get_mut(column).and_then(Option::as_mut)
    }

    /// Persists every symbol dictionary of the table.
    pub fn write_symbols(&self) -> crate::Result<()> {
        for (i, table) in self.symbols.iter().enumerate() {
            if let Some(table) = table {
                table.save(&symbol_file(&self.root, &self.schema.columns()[i].name))?;
            }
        }
        Ok(())
    }

    /// Opens a writer for a fresh partition directory.
    pub fn begin_partition<'t>(
        &'t mut self,
        partition: &str,
        ts_parser: &'t TimestampParser,
    ) -> crate::Result<PartitionWriter<'t>> {
        let dir = self.root.join(partition);
        std::fs::create_dir_all(&dir)?;
        PartitionWriter::create(dir, &self.schema, &mut self.symbols, ts_parser)
    }

    /// Records `partition` as attached. The partition list is the commit
    /// point of the attach protocol, so the record is synced through.
    pub fn attach_partition(&mut self, partition: &str, row_count: u64) -> crate::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(PARTITIONS_FILE))?;
        let mut out = BufWriter::new(file);
        out.write_u32::<LittleEndian>(partition.len() as u32)?;
        out.write_all(partition.as_bytes())?;
        out.write_u64::<LittleEndian>(row_count)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        self.partitions.push((partition.to_string(), row_count));
        Ok(())
    }

    fn write_meta(&self) -> crate::Result<()> {
        let mut out = BufWriter::new(File::create(self.root.join(META_FILE))?);
        out.write_u32::<LittleEndian>(META_VERSION)?;
        out.write_u32::<LittleEndian>(self.schema.column_count() as u32)?;
        out.write_u32::<LittleEndian>(self.schema.timestamp_index() as u32)?;
        for column in self.schema.columns() {
            out.write_u8(column.ty.tag())?;
            out.write_u32::<LittleEndian>(column.name.len() as u32)?;
            out.write_all(column.name.as_bytes())?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }
}

fn empty_symbols(schema: &Schema) -> Vec<Option<SymbolTable>> {
    schema
        .columns()
        .iter()
        .map(|c| {
            if c.ty == ColumnType::Symbol {
                Some(SymbolTable::new())
            } else {
                None
            }
        })
        .collect()
}

fn read_meta(path: &Path) -> crate::Result<Schema> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let corrupt = || LoadError::CorruptMeta(path.to_path_buf());
    if bytes.len() < 12 || LittleEndian::read_u32(&bytes[0..4]) != META_VERSION {
        return Err(corrupt());
    }
    let column_count = LittleEndian::read_u32(&bytes[4..8]) as usize;
    let timestamp_index = LittleEndian::read_u32(&bytes[8..12]) as usize;
    let mut pos = 12usize;
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        if pos + 5 > bytes.len() {
            return Err(corrupt());
        }
        let ty = ColumnType::from_tag(bytes[pos]).ok_or_else(corrupt)?;
        let name_len = LittleEndian::read_u32(&bytes[pos + 1..pos + 5]) as usize;
        pos += 5;
        if pos + name_len > bytes.len() {
            return Err(corrupt());
        }
        let name = String::from_utf8(bytes[pos..pos + name_len].to_vec())
            .map_err(|_| corrupt())?;
        pos += name_len;
        columns.push(Column { name, ty });
    }
    if timestamp_index >= columns.len() {
        return Err(corrupt());
    }
    Ok(Schema::new(columns, timestamp_index, false))
}

fn read_partitions(path: &Path) -> crate::Result<Vec<(String, u64)>> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }
    let mut partitions = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let name_len = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
        pos += 4;
        if pos + name_len + 8 > bytes.len() {
            break;
        }
        let name = String::from_utf8_lossy(&bytes[pos..pos + name_len]).into_owned();
        pos += name_len;
        let rows = LittleEndian::read_u64(&bytes[pos..pos + 8]);
        pos += 8;
        partitions.push((name, rows));
    }
    Ok(partitions)
}

/// Row count of a partition directory, taken from the designated
/// timestamp column file.
pub fn partition_row_count(dir: &Path, schema: &Schema) -> crate::Result<u64> {
    let ts_column = &schema.columns()[schema.timestamp_index()].name;
    let len = std::fs::metadata(fixed_file(dir, ts_column))?.len();
    Ok(len / 8)
}

enum ColumnFiles {
    Fixed(BufWriter<File>),
    Key(BufWriter<File>),
    Var {
        data: BufWriter<File>,
        offsets: BufWriter<File>,
        data_len: u64,
    },
}

#[derive(Debug, Copy, Clone)]
enum Staged {
    I64(i64),
    F64(f64),
    Key(i32),
    Str { start: usize, len: usize },
}

/// A field that failed type conversion; the caller decides what the
/// failure means (skip the row, null the column, abort the load).
#[derive(Debug)]
pub struct FieldError {
    pub column: usize,
}

/// Appends rows to one partition directory, column by column.
///
/// Values are staged per row and only reach the column files on
/// [`RowWriter::append`], which is what makes `cancel` free.
pub struct PartitionWriter<'t> {
    dir: PathBuf,
    files: Vec<ColumnFiles>,
    schema: &'t Schema,
    symbols: &'t mut [Option<SymbolTable>],
    ts_parser: &'t TimestampParser,
    staged: Vec<Option<Staged>>,
    arena: Vec<u8>,
    row_count: u64,
}

impl<'t> PartitionWriter<'t> {
    fn create(
        dir: PathBuf,
        schema: &'t Schema,
        symbols: &'t mut [Option<SymbolTable>],
        ts_parser: &'t TimestampParser,
    ) -> crate::Result<Self> {
        let mut files = Vec::with_capacity(schema.column_count());
        for column in schema.columns() {
            files.push(match column.ty {
                ColumnType::Symbol => {
                    ColumnFiles::Key(BufWriter::new(File::create(key_file(&dir, &column.name))?))
                }
                ColumnType::Str => ColumnFiles::Var {
                    data: BufWriter::new(File::create(fixed_file(&dir, &column.name))?),
                    offsets: BufWriter::new(File::create(offsets_file(&dir, &column.name))?),
                    data_len: 0,
                },
                _ => ColumnFiles::Fixed(BufWriter::new(File::create(fixed_file(
                    &dir,
                    &column.name,
                ))?)),
            });
        }
        let staged = vec![None; schema.column_count()];
        Ok(Self {
            dir,
            files,
            schema,
            symbols,
            ts_parser,
            staged,
            arena: Vec::new(),
            row_count: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Starts a row with the given designated timestamp.
    pub fn new_row(&mut self, timestamp: i64) -> RowWriter<'_, 't> {
        for slot in self.staged.iter_mut() {
            *slot = None;
        }
        self.arena.clear();
        self.staged[self.schema.timestamp_index()] = Some(Staged::I64(timestamp));
        RowWriter { writer: self }
    }

    /// Flushes buffered column data and optionally syncs it to disk.
    pub fn commit(&mut self, sync: bool) -> crate::Result<()> {
        for files in self.files.iter_mut() {
            match files {
                ColumnFiles::Fixed(out) | ColumnFiles::Key(out) => {
                    out.flush()?;
                    if sync {
                        out.get_ref().sync_all()?;
                    }
                }
                ColumnFiles::Var { data, offsets, .. } => {
                    data.flush()?;
                    offsets.flush()?;
                    if sync {
                        data.get_ref().sync_all()?;
                        offsets.get_ref().sync_all()?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// One row being assembled; obtained from [`PartitionWriter::new_row`].
pub struct RowWriter<'w, 't> {
    writer: &'w mut PartitionWriter<'t>,
}

impl<'w, 't> RowWriter<'w, 't> {
    /// Converts and stages one field. An empty field stages null.
    pub fn put(&mut self, column: usize, bytes: &[u8]) -> Result<(), FieldError> {
        if bytes.is_empty() {
            self.put_null(column);
            return Ok(());
        }
        let fail = || FieldError { column };
        let staged = match self.writer.schema.columns()[column].ty {
            ColumnType::Timestamp => {
                Staged::I64(self.writer.ts_parser.parse(bytes).ok_or_else(fail)?)
            }
            ColumnType::Long => Staged::I64(parse_long(bytes).ok_or_else(fail)?),
            ColumnType::Double => Staged::F64(parse_double(bytes).ok_or_else(fail)?),
            ColumnType::Symbol => {
                let value = std::str::from_utf8(bytes).map_err(|_| fail())?;
                let table = self.writer.symbols[column]
                    .as_mut()
                    .ok_or_else(fail)?;
                Staged::Key(table.intern(value))
            }
            ColumnType::Str => {
                let start = self.writer.arena.len();
                self.writer.arena.extend_from_slice(bytes);
                Staged::Str {
                    start,
                    len: bytes.len(),
                }
            }
        };
        self.writer.staged[column] = Some(staged);
        Ok(())
    }

    pub fn put_null(&mut self, column: usize) {
        self.writer.staged[column] = None;
    }

    /// Writes the staged row to the column files.
    pub fn append(self) -> crate::Result<()> {
        let writer = self.writer;
        for (column, files) in writer.files.iter_mut().enumerate() {
            let staged = writer.staged[column];
            match files {
                ColumnFiles::Fixed(out) => match staged {
                    Some(Staged::I64(v)) => out.write_i64::<LittleEndian>(v)?,
                    Some(Staged::F64(v)) => out.write_f64::<LittleEndian>(v)?,
                    _ => match writer.schema.columns()[column].ty {
                        ColumnType::Double => out.write_f64::<LittleEndian>(f64::NAN)?,
                        _ => out.write_i64::<LittleEndian>(NULL_LONG)?,
                    },
                },
                ColumnFiles::Key(out) => match staged {
                    Some(Staged::Key(key)) => out.write_i32::<LittleEndian>(key)?,
                    _ => out.write_i32::<LittleEndian>(NULL_KEY)?,
                },
                ColumnFiles::Var {
                    data,
                    offsets,
                    data_len,
                } => {
                    offsets.write_u64::<LittleEndian>(*data_len)?;
                    match staged {
                        Some(Staged::Str { start, len }) => {
                            data.write_u32::<LittleEndian>(len as u32)?;
                            data.write_all(&writer.arena[start..start + len])?;
                            *data_len += 4 + len as u64;
                        }
                        _ => {
                            data.write_u32::<LittleEndian>(NULL_STR_LEN)?;
                            *data_len += 4;
                        }
                    }
                }
            }
        }
        writer.row_count += 1;
        Ok(())
    }

    /// Drops the staged row; nothing has touched the files yet.
    pub fn cancel(self) {}
}

/// Reads a whole fixed-width i64 column.
pub fn read_i64_column(path: &Path) -> crate::Result<Vec<i64>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(bytes
        .chunks_exact(8)
        .map(LittleEndian::read_i64)
        .collect())
}

/// Reads a whole symbol key column.
pub fn read_key_column(path: &Path) -> crate::Result<Vec<i32>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(LittleEndian::read_i32)
        .collect())
}
