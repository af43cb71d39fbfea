//! Cell classification for the versioned row format.
//!
//! Every cell in a row carries a single-byte qualifier that determines how
//! the read and compaction paths treat it. Qualifiers sort byte-wise, so a
//! row scan yields commit markers first, then tombstones, then user data,
//! then counters, then checkpoints.

use basalt_common::{Result, SiError, Timestamp};

/// Commit marker: value is the 8-byte global commit timestamp of the writer.
pub const QUAL_COMMIT_TS: u8 = b'0';
/// Tombstone or anti-tombstone, distinguished by value.
pub const QUAL_TOMBSTONE: u8 = b'1';
/// User row data: value is an encoded [`RowPayload`](crate::payload::RowPayload).
pub const QUAL_USER_DATA: u8 = b'7';
/// Foreign-key reference counter delta.
pub const QUAL_FK_COUNTER: u8 = b'9';
/// Checkpoint: collapsed row history with an inline commit timestamp.
pub const QUAL_CHECKPOINT: u8 = b'z';

/// A tombstone deletes the row as of its timestamp.
pub const TOMBSTONE_VALUE: &[u8] = b"";
/// An anti-tombstone revives a previously deleted row.
pub const ANTI_TOMBSTONE_VALUE: &[u8] = &[0];

/// The role a cell plays in row reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    CommitTimestamp,
    Tombstone,
    AntiTombstone,
    UserData,
    ForeignKeyCounter,
    Checkpoint,
    Other,
}

impl CellType {
    /// Classify a cell from its qualifier byte and value.
    ///
    /// Only the tombstone qualifier inspects the value: an empty value is a
    /// tombstone, a single zero byte an anti-tombstone, anything else is
    /// unrecognized.
    pub fn classify(qualifier: u8, value: &[u8]) -> CellType {
        match qualifier {
            QUAL_COMMIT_TS => CellType::CommitTimestamp,
            QUAL_TOMBSTONE if value == TOMBSTONE_VALUE => CellType::Tombstone,
            QUAL_TOMBSTONE if value == ANTI_TOMBSTONE_VALUE => CellType::AntiTombstone,
            QUAL_TOMBSTONE => CellType::Other,
            QUAL_USER_DATA => CellType::UserData,
            QUAL_FK_COUNTER => CellType::ForeignKeyCounter,
            QUAL_CHECKPOINT => CellType::Checkpoint,
            _ => CellType::Other,
        }
    }
}

/// Encode a commit marker value.
pub fn encode_commit_marker(global_commit_ts: Timestamp) -> Vec<u8> {
    global_commit_ts.to_be_bytes().to_vec()
}

/// Decode a commit marker value.
pub fn decode_commit_marker(value: &[u8]) -> Result<Timestamp> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| SiError::Corrupt(format!("Commit marker of {} bytes", value.len())))?;
    Ok(Timestamp::from_be_bytes(bytes))
}

/// Encode a checkpoint value: the global commit timestamp of the newest
/// collapsed version followed by the collapsed payload bytes.
pub fn encode_checkpoint(global_commit_ts: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&global_commit_ts.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a checkpoint value into its commit timestamp and payload bytes.
pub fn decode_checkpoint(value: &[u8]) -> Result<(Timestamp, &[u8])> {
    if value.len() < 8 {
        return Err(SiError::Corrupt(format!(
            "Checkpoint cell of {} bytes",
            value.len()
        )));
    }
    let (ts, payload) = value.split_at(8);
    let bytes: [u8; 8] = ts.try_into().map_err(|_| SiError::Corrupt("Checkpoint timestamp".into()))?;
    Ok((Timestamp::from_be_bytes(bytes), payload))
}

/// Encode a foreign-key counter delta together with the constraint it
/// belongs to, so counter cells are self-describing.
pub fn encode_fk_delta(delta: i64, constraint: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + constraint.len());
    out.extend_from_slice(&delta.to_be_bytes());
    out.extend_from_slice(constraint.as_bytes());
    out
}

/// Decode a foreign-key counter cell.
pub fn decode_fk_delta(value: &[u8]) -> Result<(i64, &str)> {
    if value.len() < 8 {
        return Err(SiError::Corrupt(format!(
            "Counter cell of {} bytes",
            value.len()
        )));
    }
    let (delta, name) = value.split_at(8);
    let bytes: [u8; 8] = delta.try_into().map_err(|_| SiError::Corrupt("Counter delta".into()))?;
    let constraint = std::str::from_utf8(name)
        .map_err(|_| SiError::Corrupt("Counter constraint name is not UTF-8".into()))?;
    Ok((i64::from_be_bytes(bytes), constraint))
}
