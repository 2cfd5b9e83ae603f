//! Symbol dictionaries: interned strings stored as small integer keys.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// An insertion-ordered string dictionary for one symbol column.
///
/// Keys are dense and start at 0; a key never moves once assigned, and
/// no two keys map to the same string.
#[derive(Debug, Default)]
pub struct SymbolTable {
    values: Vec<String>,
    keys: HashMap<String, i32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the key of `value`, assigning the next free key on first
    /// sight.
    pub fn intern(&mut self, value: &str) -> i32 {
        if let Some(&key) = self.keys.get(value) {
            return key;
        }
        let key = self.values.len() as i32;
        self.values.push(value.to_string());
        self.keys.insert(value.to_string(), key);
        key
    }

    pub fn key_of(&self, value: &str) -> Option<i32> {
        self.keys.get(value).copied()
    }

    pub fn value_of(&self, key: i32) -> Option<&str> {
        if key < 0 {
            return None;
        }
        self.values.get(key as usize).map(String::as_str)
    }

    /// Values in key order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Reads a dictionary file: a sequence of `(u32 length, UTF-8 bytes)`
    /// values in key order. A missing file is an empty dictionary.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let mut table = Self::new();
        let mut bytes = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(table),
            Err(e) => return Err(e.into()),
        }
        let mut pos = 0usize;
        while pos + 4 <= bytes.len() {
            let len = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                break;
            }
            let value = String::from_utf8_lossy(&bytes[pos..pos + len]).into_owned();
            pos += len;
            table.intern(&value);
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for value in &self.values {
            out.write_u32::<LittleEndian>(value.len() as u32)?;
            out.write_all(value.as_bytes())?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }
}
