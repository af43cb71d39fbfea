//! Raw cell representation

use basalt_common::Timestamp;

/// A single versioned cell as stored: one value for one qualifier of one row
/// at one timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCell {
    /// Row key (unescaped)
    pub row: Vec<u8>,

    /// Qualifier byte grouping the cell's kind within the row
    pub qualifier: u8,

    /// Version timestamp (the writer's transaction id)
    pub ts: Timestamp,

    /// Cell value bytes
    pub value: Vec<u8>,
}

impl RawCell {
    pub fn new(
        row: impl Into<Vec<u8>>,
        qualifier: u8,
        ts: Timestamp,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            qualifier,
            ts,
            value: value.into(),
        }
    }
}
