//! Error taxonomy and retry classification
//!
//! Every failure surfaced by the transaction core maps onto one of these
//! kinds. Callers drive retry loops off the classification predicates
//! instead of matching variants, so adding a kind never silently changes a
//! retry decision elsewhere.

use crate::timestamp::TxnId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SiError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiError {
    // Lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Transaction {txn_id} cannot {action} while {status}")]
    InvalidState {
        txn_id: TxnId,
        status: String,
        action: String,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TxnId),

    // Write conflicts: never retryable, the transaction must be rolled back
    #[error("Write conflict between transactions {txn_id} and {other}")]
    WriteConflict {
        txn_id: TxnId,
        other: TxnId,
        row: Vec<u8>,
    },

    // Constraint violations
    #[error("Primary key violation on {constraint}")]
    PrimaryKeyViolation { constraint: String, row: Vec<u8> },

    #[error("Unique constraint violation on {constraint}")]
    UniqueViolation { constraint: String, row: Vec<u8> },

    #[error("Foreign key violation on {constraint}")]
    ForeignKeyViolation { constraint: String, row: Vec<u8> },

    #[error("NULL constraint violation on {constraint}, column {column}")]
    NotNullViolation { constraint: String, column: u16 },

    // Infrastructure errors, transient to varying degrees
    #[error("Region unavailable: {0}")]
    RegionUnavailable(String),

    #[error("Region too busy: {0}")]
    RegionTooBusy(String),

    #[error("Timed out during {0}")]
    Timeout(String),

    #[error("Disconnected from {0}")]
    Disconnected(String),

    // Data and storage errors
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl SiError {
    /// A bounded number of retries, usually with backoff, may clear the
    /// failure.
    pub fn can_finitely_retry(&self) -> bool {
        self.can_infinitely_retry()
            || matches!(
                self,
                SiError::RegionTooBusy(_) | SiError::Timeout(_) | SiError::Disconnected(_)
            )
    }

    /// Retrying forever is safe; the condition clears when the region comes
    /// back.
    pub fn can_infinitely_retry(&self) -> bool {
        matches!(self, SiError::RegionUnavailable(_))
    }

    /// The attempt may or may not have taken effect, so the whole
    /// transaction must restart under a fresh id.
    pub fn needs_transactional_retry(&self) -> bool {
        matches!(
            self,
            SiError::Timeout(_) | SiError::Disconnected(_) | SiError::RegionUnavailable(_)
        )
    }
}

/// Wire form of [`SiError`] for node-to-node transfer
///
/// The full variant is carried, so the receiving side reconstructs an error
/// with identical kind, message, and retry classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTransport {
    error: SiError,
    origin: Option<String>,
}

impl ErrorTransport {
    pub fn new(error: SiError) -> Self {
        Self {
            error,
            origin: None,
        }
    }

    /// Tag the transport with the node or region that produced the error
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn error(&self) -> &SiError {
        &self.error
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn into_error(self) -> SiError {
        self.error
    }

    /// Serialize to bytes for transfer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| SiError::Corrupt(format!("Failed to serialize error transport: {}", e)))?;
        Ok(bytes)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| {
            SiError::Corrupt(format!("Failed to deserialize error transport: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    fn txn(n: u64) -> TxnId {
        Timestamp::new(n)
    }

    #[test]
    fn test_region_unavailable_retries_forever() {
        let err = SiError::RegionUnavailable("region-7".to_string());

        assert!(err.can_infinitely_retry());
        assert!(err.can_finitely_retry());
        assert!(err.needs_transactional_retry());
    }

    #[test]
    fn test_region_too_busy_retries_finitely() {
        let err = SiError::RegionTooBusy("region-7".to_string());

        assert!(err.can_finitely_retry());
        assert!(!err.can_infinitely_retry());
        assert!(!err.needs_transactional_retry());
    }

    #[test]
    fn test_timeout_needs_transactional_retry() {
        let err = SiError::Timeout("row scan".to_string());

        assert!(err.can_finitely_retry());
        assert!(err.needs_transactional_retry());
        assert!(!err.can_infinitely_retry());
    }

    #[test]
    fn test_write_conflict_never_retries() {
        let err = SiError::WriteConflict {
            txn_id: txn(100),
            other: txn(101),
            row: b"row-a".to_vec(),
        };

        assert!(!err.can_finitely_retry());
        assert!(!err.can_infinitely_retry());
        assert!(!err.needs_transactional_retry());
    }

    #[test]
    fn test_constraint_violations_never_retry() {
        let errors = [
            SiError::PrimaryKeyViolation {
                constraint: "pk".to_string(),
                row: b"r".to_vec(),
            },
            SiError::UniqueViolation {
                constraint: "uq_name".to_string(),
                row: b"r".to_vec(),
            },
            SiError::ForeignKeyViolation {
                constraint: "fk_parent".to_string(),
                row: b"r".to_vec(),
            },
            SiError::NotNullViolation {
                constraint: "nn_col".to_string(),
                column: 3,
            },
        ];

        for err in errors {
            assert!(!err.can_finitely_retry(), "{} should not retry", err);
            assert!(!err.needs_transactional_retry());
        }
    }

    #[test]
    fn test_transport_roundtrip_preserves_classification() {
        let errors = [
            SiError::RegionUnavailable("r1".to_string()),
            SiError::RegionTooBusy("r2".to_string()),
            SiError::Timeout("commit".to_string()),
            SiError::Disconnected("peer-3".to_string()),
            SiError::WriteConflict {
                txn_id: txn(5),
                other: txn(9),
                row: b"k".to_vec(),
            },
            SiError::TransactionNotFound(txn(77)),
        ];

        for err in errors {
            let bytes = ErrorTransport::new(err.clone()).to_bytes().unwrap();
            let back = ErrorTransport::from_bytes(&bytes).unwrap().into_error();

            assert_eq!(err, back);
            assert_eq!(err.to_string(), back.to_string());
            assert_eq!(err.can_finitely_retry(), back.can_finitely_retry());
            assert_eq!(err.can_infinitely_retry(), back.can_infinitely_retry());
            assert_eq!(
                err.needs_transactional_retry(),
                back.needs_transactional_retry()
            );
        }
    }

    #[test]
    fn test_transport_carries_origin() {
        let transport = ErrorTransport::new(SiError::RegionTooBusy("r9".to_string()))
            .with_origin("node-2");

        let bytes = transport.to_bytes().unwrap();
        let back = ErrorTransport::from_bytes(&bytes).unwrap();

        assert_eq!(back.origin(), Some("node-2"));
    }

    #[test]
    fn test_display_names_the_transactions() {
        let err = SiError::WriteConflict {
            txn_id: txn(100),
            other: txn(103),
            row: b"r".to_vec(),
        };
        assert_eq!(
            err.to_string(),
            "Write conflict between transactions 100 and 103"
        );
    }
}
