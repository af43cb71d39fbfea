//! Transaction lifecycle management
//!
//! One `LifecycleManager` owns the begin/elevate/commit/rollback surface.
//! Commit is locally two-phase: the record moves to COMMITTING, the
//! registered `CommitValidator` (the write path) gets a veto, and only then
//! does the record become COMMITTED with its commit timestamp. A validation
//! failure parks the record at ERROR, which voids the writes for every
//! reader.

use crate::oracle::TimestampOracle;
use crate::record::{TxnRecord, TxnStatus};
use crate::store::TxnStore;
use basalt_common::{IsolationLevel, Result, SiError, Timestamp, TxnId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Parameters for beginning a transaction
#[derive(Debug, Clone, Default)]
pub struct TxnInfo {
    /// Parent transaction for nested begins
    pub parent: Option<TxnId>,

    /// Isolation level for reads under this transaction
    pub isolation: IsolationLevel,

    /// Begin write-capable instead of elevating later
    pub writable: bool,
}

/// Administrative actions on a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Commit,
    Rollback,

    /// Rollback on behalf of the reaper when keep-alive lapsed
    TimeOut,
}

/// Result of a lifecycle action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: TxnStatus,
    pub commit_ts: Option<Timestamp>,
    pub reason: Option<String>,
}

/// Commit-time validation hook, registered by the write path
pub trait CommitValidator: Send + Sync {
    /// Veto the commit by returning the conflict error
    fn validate_commit(&self, txn: &TxnRecord, commit_ts: Timestamp) -> Result<()>;
}

/// Validator that accepts every commit
pub struct NoValidation;

impl CommitValidator for NoValidation {
    fn validate_commit(&self, _txn: &TxnRecord, _commit_ts: Timestamp) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    store: Arc<TxnStore>,
    oracle: Arc<TimestampOracle>,
    validator: RwLock<Option<Arc<dyn CommitValidator>>>,

    /// Ids allocated but not yet durable as ACTIVE records. Holding these
    /// keeps the watermark from passing a begin that is still in flight.
    pending_begins: Mutex<BTreeSet<TxnId>>,
}

impl LifecycleManager {
    pub fn new(store: Arc<TxnStore>, oracle: Arc<TimestampOracle>) -> Self {
        Self {
            store,
            oracle,
            validator: RwLock::new(None),
            pending_begins: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register the commit-time validator
    pub fn set_validator(&self, validator: Arc<dyn CommitValidator>) {
        *self.validator.write() = Some(validator);
    }

    /// Begin a transaction: allocate the next id and persist an ACTIVE record
    pub fn begin(&self, info: TxnInfo) -> Result<TxnId> {
        if let Some(parent_id) = info.parent {
            let parent = self
                .store
                .get(parent_id)?
                .ok_or(SiError::TransactionNotFound(parent_id))?;
            if parent.status.is_terminal() {
                return Err(SiError::Lifecycle(format!(
                    "Parent transaction {} is already {}",
                    parent_id, parent.status
                )));
            }
        }

        // Allocation and pending registration happen under one lock so the
        // watermark can never observe the id as neither pending nor stored
        let txn_id = {
            let mut pending = self.pending_begins.lock();
            let id = self.oracle.next_timestamp()?;
            pending.insert(id);
            id
        };

        let record = TxnRecord::new(
            txn_id,
            info.parent,
            info.isolation,
            info.writable,
            unix_seconds(),
        );
        let stored = self.store.put(&record);
        self.pending_begins.lock().remove(&txn_id);
        stored.map_err(|e| {
            SiError::Lifecycle(format!("Failed to persist transaction {}: {}", txn_id, e))
        })?;

        tracing::debug!(
            "Began transaction {} (writable: {}, parent: {:?})",
            txn_id,
            info.writable,
            info.parent
        );
        Ok(txn_id)
    }

    /// Make a read-only transaction write-capable
    ///
    /// Legal only while ACTIVE; elevating an already writable transaction
    /// is a no-op that keeps the original scope.
    pub fn elevate(&self, txn_id: TxnId, write_scope: &[u8]) -> Result<()> {
        let mut record = self.get_txn(txn_id)?;

        if record.status != TxnStatus::Active {
            return Err(invalid_state(&record, "elevate"));
        }
        if record.writable {
            return Ok(());
        }

        record.writable = true;
        record.write_scope = Some(write_scope.to_vec());
        self.store.put(&record)?;

        tracing::debug!("Elevated transaction {}", txn_id);
        Ok(())
    }

    /// Refresh the liveness stamp; returns false once the transaction is
    /// terminal
    pub fn keep_alive(&self, txn_id: TxnId) -> Result<bool> {
        let mut record = self.get_txn(txn_id)?;

        if record.status.is_terminal() {
            return Ok(false);
        }

        record.keep_alive = unix_seconds();
        self.store.put(&record)?;
        Ok(true)
    }

    /// Drive a transaction to a terminal state
    pub fn lifecycle_action(&self, txn_id: TxnId, action: LifecycleAction) -> Result<ActionOutcome> {
        match action {
            LifecycleAction::Commit => self.commit(txn_id),
            LifecycleAction::Rollback => self.rollback(txn_id, "requested"),
            LifecycleAction::TimeOut => self.rollback(txn_id, "keep-alive expired"),
        }
    }

    fn commit(&self, txn_id: TxnId) -> Result<ActionOutcome> {
        let mut record = self.get_txn(txn_id)?;

        if !record.transition_to(TxnStatus::Committing) {
            return Err(invalid_state(&record, "commit"));
        }
        self.store.put(&record)?;

        let commit_ts = self.oracle.next_timestamp()?;

        if record.writable {
            let validator = self.validator.read().clone();
            if let Some(validator) = validator {
                if let Err(conflict) = validator.validate_commit(&record, commit_ts) {
                    record.transition_to(TxnStatus::Error);
                    self.store.put(&record)?;
                    tracing::warn!("Commit validation failed for {}: {}", txn_id, conflict);
                    return Err(conflict);
                }
            }
        }

        record.transition_to(TxnStatus::Committed);
        record.commit_ts = Some(commit_ts);
        if record.parent.is_none() {
            record.global_commit_ts = Some(commit_ts);
        }
        self.store.put(&record)?;

        tracing::debug!("Committed transaction {} at {}", txn_id, commit_ts);
        Ok(ActionOutcome {
            status: TxnStatus::Committed,
            commit_ts: Some(commit_ts),
            reason: None,
        })
    }

    fn rollback(&self, txn_id: TxnId, reason: &str) -> Result<ActionOutcome> {
        let mut record = self.get_txn(txn_id)?;

        // Rolling back twice is harmless
        if record.status == TxnStatus::RolledBack {
            return Ok(ActionOutcome {
                status: TxnStatus::RolledBack,
                commit_ts: None,
                reason: Some(reason.to_string()),
            });
        }

        if !record.transition_to(TxnStatus::RolledBack) {
            return Err(invalid_state(&record, "rollback"));
        }
        self.store.put(&record)?;

        tracing::debug!("Rolled back transaction {} ({})", txn_id, reason);
        Ok(ActionOutcome {
            status: TxnStatus::RolledBack,
            commit_ts: None,
            reason: Some(reason.to_string()),
        })
    }

    /// Point lookup of a record that must exist
    pub fn get_txn(&self, txn_id: TxnId) -> Result<TxnRecord> {
        self.store
            .get(txn_id)?
            .ok_or(SiError::TransactionNotFound(txn_id))
    }

    /// Live records with ids in `[min, max]`, sorted ascending
    pub fn get_active_txns(&self, min: TxnId, max: TxnId) -> Result<Vec<TxnRecord>> {
        self.store.active_in_range(min, max)
    }

    /// Live transaction ids in `[min, max]`, deduplicated and sorted
    pub fn get_active_txn_ids(&self, min: TxnId, max: TxnId) -> Result<Vec<TxnId>> {
        Ok(self
            .get_active_txns(min, max)?
            .iter()
            .map(|r| r.txn_id)
            .collect())
    }

    /// The checkpoint watermark: every version at or above it must survive
    ///
    /// Minimum over in-flight begins and persisted live records, falling
    /// back to the oracle position when nothing is live. The oracle position
    /// is captured together with the pending set, so a begin can never slip
    /// between the two reads. Monotone non-decreasing across calls.
    pub fn oldest_active_ts(&self) -> Result<Timestamp> {
        let (cur, pending_min) = {
            let pending = self.pending_begins.lock();
            (self.oracle.current(), pending.iter().next().copied())
        };

        let active_min = self
            .get_active_txns(Timestamp::ZERO, cur)?
            .first()
            .map(|r| r.txn_id);

        Ok([pending_min, active_min]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(cur))
    }

    /// Time out ACTIVE transactions whose keep-alive stamp is older than
    /// `max_age_secs`; returns the ids that were rolled back
    pub fn reap_stale(&self, max_age_secs: u64) -> Result<Vec<TxnId>> {
        let cutoff = unix_seconds().saturating_sub(max_age_secs);

        let mut reaped = Vec::new();
        for record in self.get_active_txns(Timestamp::ZERO, Timestamp::MAX)? {
            if record.status != TxnStatus::Active || record.keep_alive > cutoff {
                continue;
            }
            match self.lifecycle_action(record.txn_id, LifecycleAction::TimeOut) {
                Ok(_) => reaped.push(record.txn_id),
                Err(e) => {
                    tracing::warn!(
                        "Failed to time out stale transaction {}: {}",
                        record.txn_id,
                        e
                    );
                }
            }
        }

        Ok(reaped)
    }
}

fn invalid_state(record: &TxnRecord, action: &str) -> SiError {
    SiError::InvalidState {
        txn_id: record.txn_id,
        status: record.status.to_string(),
        action: action.to_string(),
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("System clock before Unix epoch")
        .as_secs()
}
