//! Cell key encoding
//!
//! Cells are stored under `{escaped row}{terminator}{qualifier}{!ts}`:
//! - 0x00 bytes in the row are escaped as 0x00 0xFF and the row is closed
//!   with the 0x00 0x01 terminator, so rows of any content sort
//!   lexicographically and a row is always a strict prefix boundary.
//! - The qualifier is a single byte, grouping a row's cells by kind.
//! - The timestamp is stored inverted (big-endian of `u64::MAX - ts`), so a
//!   forward scan yields versions newest-first.

use crate::error::{Error, Result};
use basalt_common::Timestamp;

/// Closes the escaped row portion of a key
const TERMINATOR: [u8; 2] = [0x00, 0x01];

/// Escape sequence for a literal 0x00 inside a row
const ESCAPE: [u8; 2] = [0x00, 0xFF];

/// Number of bytes following the terminator: qualifier + inverted timestamp
const SUFFIX_LEN: usize = 1 + 8;

fn push_escaped(out: &mut Vec<u8>, row: &[u8]) {
    for &b in row {
        if b == 0x00 {
            out.extend_from_slice(&ESCAPE);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

/// Encode a full cell key
pub fn encode_cell_key(row: &[u8], qualifier: u8, ts: Timestamp) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + TERMINATOR.len() + SUFFIX_LEN);
    push_escaped(&mut key, row);
    key.push(qualifier);
    key.extend_from_slice(&ts.to_inverted_bytes());
    key
}

/// Encode the prefix covering every cell of a row
pub fn encode_row_prefix(row: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + TERMINATOR.len());
    push_escaped(&mut key, row);
    key
}

/// Encode the prefix covering every version of one qualifier within a row
pub fn encode_qualifier_prefix(row: &[u8], qualifier: u8) -> Vec<u8> {
    let mut key = encode_row_prefix(row);
    key.push(qualifier);
    key
}

/// Decode a cell key back into `(row, qualifier, timestamp)`
pub fn decode_cell_key(key: &[u8]) -> Result<(Vec<u8>, u8, Timestamp)> {
    let mut row = Vec::new();
    let mut iter = key.iter().enumerate();

    let suffix_start = loop {
        let Some((i, &b)) = iter.next() else {
            return Err(Error::Encoding("Cell key missing terminator".to_string()));
        };
        if b != 0x00 {
            row.push(b);
            continue;
        }
        match iter.next() {
            Some((_, 0xFF)) => row.push(0x00),
            Some((_, 0x01)) => break i + 2,
            _ => {
                return Err(Error::Encoding(format!(
                    "Invalid escape sequence at offset {}",
                    i
                )));
            }
        }
    };

    let suffix = &key[suffix_start..];
    if suffix.len() != SUFFIX_LEN {
        return Err(Error::Encoding(format!(
            "Cell key suffix has {} bytes, expected {}",
            suffix.len(),
            SUFFIX_LEN
        )));
    }

    let qualifier = suffix[0];
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&suffix[1..]);
    let ts = Timestamp::from_inverted_bytes(ts_bytes);

    Ok((row, qualifier, ts))
}
