//! Timestamps and transaction identifiers
//!
//! Begin timestamps and commit timestamps are drawn from one monotone
//! sequence, so a transaction id doubles as its begin timestamp and any two
//! events in the version space are totally ordered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the shared version space.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

/// Transaction ID type alias
///
/// Ids come from the same sequence as commit timestamps, so for any
/// transaction `begin < commit` holds and ids never repeat.
pub type TxnId = Timestamp;

impl Timestamp {
    /// The floor of the version space; never issued to a transaction
    pub const ZERO: Timestamp = Timestamp(0);

    /// Upper bound usable as an open scan limit
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Timestamp(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The immediately following point in the version space
    pub const fn next(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }

    /// Big-endian bytes, ordered the same way as the timestamps themselves
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Timestamp(u64::from_be_bytes(bytes))
    }

    /// Complemented big-endian bytes, so newer timestamps sort first under
    /// lexicographic byte order
    pub fn to_inverted_bytes(&self) -> [u8; 8] {
        (u64::MAX - self.0).to_be_bytes()
    }

    pub fn from_inverted_bytes(bytes: [u8; 8]) -> Self {
        Timestamp(u64::MAX - u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Timestamp(value)
    }
}
