//! Transaction records and the status state machine

use basalt_common::{IsolationLevel, Result, SiError, Timestamp, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Begun, operations being applied
    Active,

    /// Commit requested, validation in flight
    Committing,

    /// Terminal: commit timestamp assigned, writes durable
    Committed,

    /// Terminal: rolled back, writes void
    RolledBack,

    /// Terminal: commit validation failed, writes void
    Error,
}

impl TxnStatus {
    /// Check whether a transition is legal
    ///
    /// The machine is one-directional: `Active -> {Committing, RolledBack}`,
    /// `Committing -> {Committed, Error}`. Terminal states admit nothing.
    pub fn can_transition_to(&self, next: TxnStatus) -> bool {
        matches!(
            (self, next),
            (TxnStatus::Active, TxnStatus::Committing)
                | (TxnStatus::Active, TxnStatus::RolledBack)
                | (TxnStatus::Committing, TxnStatus::Committed)
                | (TxnStatus::Committing, TxnStatus::Error)
        )
    }

    /// Check if this status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxnStatus::Committed | TxnStatus::RolledBack | TxnStatus::Error
        )
    }

    /// Live statuses count toward the active set
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnStatus::Active => "ACTIVE",
            TxnStatus::Committing => "COMMITTING",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::RolledBack => "ROLLED_BACK",
            TxnStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Global visibility of a writer's cells, resolved through the parent chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    /// The whole ancestor chain committed; cells are visible at this timestamp
    Committed(Timestamp),

    /// The writer or an ancestor is still live; visibility is undecided
    Pending,

    /// The writer or an ancestor rolled back or errored; cells are void
    Dead,
}

/// Durable per-transaction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnRecord {
    /// Transaction id, doubling as the begin timestamp
    pub txn_id: TxnId,

    /// Parent transaction for nested begins
    pub parent: Option<TxnId>,

    /// Current lifecycle status
    pub status: TxnStatus,

    /// Commit timestamp, set exactly once at COMMITTED and never changed
    pub commit_ts: Option<Timestamp>,

    /// Timestamp readers see this transaction's writes at. Equals
    /// `commit_ts` for root transactions; for a committed child it stays
    /// unset until the whole ancestor chain resolves.
    pub global_commit_ts: Option<Timestamp>,

    /// Isolation level requested at begin
    pub isolation: IsolationLevel,

    /// Write capability, false until elevated
    pub writable: bool,

    /// Scope recorded at elevation
    pub write_scope: Option<Vec<u8>>,

    /// Coarse liveness stamp (Unix seconds), refreshed by keep-alive
    pub keep_alive: u64,
}

impl TxnRecord {
    /// Create a new ACTIVE record
    pub fn new(
        txn_id: TxnId,
        parent: Option<TxnId>,
        isolation: IsolationLevel,
        writable: bool,
        keep_alive: u64,
    ) -> Self {
        Self {
            txn_id,
            parent,
            status: TxnStatus::Active,
            commit_ts: None,
            global_commit_ts: None,
            isolation,
            writable,
            write_scope: None,
            keep_alive,
        }
    }

    /// Apply a status transition if the machine allows it
    pub fn transition_to(&mut self, next: TxnStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Serialize to bytes for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes).map_err(|e| {
            SiError::Corrupt(format!("Failed to serialize transaction record: {}", e))
        })?;
        Ok(bytes)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| {
            SiError::Corrupt(format!("Failed to deserialize transaction record: {}", e))
        })
    }
}
