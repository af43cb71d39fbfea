//! Column-keyed row payloads.
//!
//! A payload maps numeric column ids to values. Updates write partial
//! payloads; the read path layers them newest-first so each column takes
//! its most recently written value. Explicit NULLs are distinct from
//! absent columns so an update can null out a column without erasing the
//! surrounding history.

use std::collections::BTreeMap;

use basalt_common::{Result, SiError};

pub type ColumnId = u16;

/// A single column slot: either an explicit NULL or a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Value(Vec<u8>),
}

/// One version of a row, keyed by column id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPayload {
    columns: BTreeMap<ColumnId, ColumnValue>,
}

impl RowPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, column: ColumnId, value: impl Into<Vec<u8>>) -> Self {
        self.columns.insert(column, ColumnValue::Value(value.into()));
        self
    }

    pub fn with_null(mut self, column: ColumnId) -> Self {
        self.columns.insert(column, ColumnValue::Null);
        self
    }

    pub fn get(&self, column: ColumnId) -> Option<&ColumnValue> {
        self.columns.get(&column)
    }

    pub fn contains(&self, column: ColumnId) -> bool {
        self.columns.contains_key(&column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = (ColumnId, &ColumnValue)> {
        self.columns.iter().map(|(id, value)| (*id, value))
    }

    /// Merge an older version underneath this one. Columns already present
    /// keep their newer value; columns only the older version has are
    /// filled in.
    pub fn fill_from(&mut self, older: &RowPayload) {
        for (id, value) in &older.columns {
            self.columns.entry(*id).or_insert_with(|| value.clone());
        }
    }

    /// Encode as a column count followed by `{id, null flag, length, bytes}`
    /// entries, all integers big-endian.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.columns.len())
            .map_err(|_| SiError::Failed("Row payload has too many columns".into()))?;
        let mut out = Vec::with_capacity(2 + self.columns.len() * 9);
        out.extend_from_slice(&count.to_be_bytes());
        for (id, value) in &self.columns {
            out.extend_from_slice(&id.to_be_bytes());
            match value {
                ColumnValue::Null => {
                    out.push(0);
                    out.extend_from_slice(&0u32.to_be_bytes());
                }
                ColumnValue::Value(bytes) => {
                    let len = u32::try_from(bytes.len())
                        .map_err(|_| SiError::Failed("Column value too large".into()))?;
                    out.push(1);
                    out.extend_from_slice(&len.to_be_bytes());
                    out.extend_from_slice(bytes);
                }
            }
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u16()?;
        let mut columns = BTreeMap::new();
        for _ in 0..count {
            let id = cursor.read_u16()?;
            let flag = cursor.read_u8()?;
            let len = cursor.read_u32()? as usize;
            let value = match flag {
                0 if len == 0 => ColumnValue::Null,
                0 => {
                    return Err(SiError::Corrupt(format!(
                        "Null column {id} with {len} value bytes"
                    )));
                }
                1 => ColumnValue::Value(cursor.read_bytes(len)?.to_vec()),
                other => {
                    return Err(SiError::Corrupt(format!(
                        "Unknown column flag {other} for column {id}"
                    )));
                }
            };
            columns.insert(id, value);
        }
        if !cursor.at_end() {
            return Err(SiError::Corrupt("Trailing bytes after row payload".into()));
        }
        Ok(Self { columns })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| SiError::Corrupt("Truncated row payload".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.read_bytes(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
