//! Transaction isolation levels

use serde::{Deserialize, Serialize};
use std::fmt;

/// Visibility rules applied by the read path
///
/// Snapshot isolation is the default and the level the conflict protocol is
/// designed around. The weaker levels relax which committed (or staged)
/// versions a reader may observe; they never change write-side behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads see only versions committed at or before the reader's begin
    /// timestamp
    #[default]
    SnapshotIsolation,

    /// Reads see the latest committed version regardless of snapshot
    ReadCommitted,

    /// Reads additionally see data staged by still-active writers
    ReadUncommitted,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::SnapshotIsolation => write!(f, "SNAPSHOT_ISOLATION"),
            IsolationLevel::ReadCommitted => write!(f, "READ_COMMITTED"),
            IsolationLevel::ReadUncommitted => write!(f, "READ_UNCOMMITTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_snapshot() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::SnapshotIsolation);
    }

    #[test]
    fn test_serde_roundtrip() {
        for level in [
            IsolationLevel::SnapshotIsolation,
            IsolationLevel::ReadCommitted,
            IsolationLevel::ReadUncommitted,
        ] {
            let json = serde_json::to_string(&level).unwrap();
            let back: IsolationLevel = serde_json::from_str(&json).unwrap();
            assert_eq!(level, back);
        }
    }
}
