//! Staging writes and first-committer-wins conflict detection.
//!
//! Mutations are staged as cells at the writing transaction's begin
//! timestamp, screened eagerly against concurrent and newer-committed
//! writers. A second screen runs at commit time through the lifecycle
//! manager's validation hook, closing the window between staging and the
//! commit timestamp.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use basalt_common::{Result, SiError, Timestamp, TxnId};
use basalt_store::{RawCell, ReadOptions, RowStore};
use basalt_txn::{CommitValidator, GlobalState, TxnRecord, TxnStatus, TxnStore};
use parking_lot::RwLock;

use crate::cell::{
    self, CellType, ANTI_TOMBSTONE_VALUE, QUAL_FK_COUNTER, QUAL_TOMBSTONE, QUAL_USER_DATA,
    TOMBSTONE_VALUE,
};
use crate::payload::{ColumnId, ColumnValue, RowPayload};
use crate::read::{collect_markers, SnapshotReader, TxnView};
use crate::resolve::ReadResolver;
use crate::row::RowState;

/// Name reported for primary-key violations, which have no declared
/// constraint of their own.
const PRIMARY_KEY: &str = "PRIMARY";

/// How many times a racing committer is re-read before conceding.
const COMMITTING_POLLS: usize = 3;
const COMMITTING_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A change to one row.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub row: Vec<u8>,
    pub op: MutationOp,
}

#[derive(Debug, Clone)]
pub enum MutationOp {
    /// Create the row; fails if a visible version already exists.
    Insert(RowPayload),
    /// Overlay the given columns on the existing row.
    Update(RowPayload),
    /// Delete the row; fails while its reference counter is positive.
    Delete,
    /// Create a unique-index surrogate row for the named constraint.
    InsertUnique { constraint: String, payload: RowPayload },
    /// Add a delta to the row's foreign-key reference counter; positive
    /// deltas fail unless the row is visible.
    AdjustFkCounter { constraint: String, delta: i64 },
}

impl Mutation {
    pub fn insert(row: impl Into<Vec<u8>>, payload: RowPayload) -> Self {
        Self { row: row.into(), op: MutationOp::Insert(payload) }
    }

    pub fn update(row: impl Into<Vec<u8>>, payload: RowPayload) -> Self {
        Self { row: row.into(), op: MutationOp::Update(payload) }
    }

    pub fn delete(row: impl Into<Vec<u8>>) -> Self {
        Self { row: row.into(), op: MutationOp::Delete }
    }

    pub fn insert_unique(
        row: impl Into<Vec<u8>>,
        constraint: impl Into<String>,
        payload: RowPayload,
    ) -> Self {
        Self {
            row: row.into(),
            op: MutationOp::InsertUnique { constraint: constraint.into(), payload },
        }
    }

    pub fn adjust_fk_counter(
        row: impl Into<Vec<u8>>,
        constraint: impl Into<String>,
        delta: i64,
    ) -> Self {
        Self {
            row: row.into(),
            op: MutationOp::AdjustFkCounter { constraint: constraint.into(), delta },
        }
    }
}

/// Stages mutations and validates commits.
///
/// Register as the lifecycle manager's commit validator so writable
/// transactions re-screen their write set when they take a commit
/// timestamp.
pub struct WritePath {
    row_store: Arc<dyn RowStore>,
    txn_store: Arc<TxnStore>,
    resolver: Arc<dyn ReadResolver>,
    reader: SnapshotReader,
    write_sets: RwLock<HashMap<TxnId, HashSet<Vec<u8>>>>,
    not_null: Vec<(ColumnId, String)>,
}

impl WritePath {
    pub fn new(
        row_store: Arc<dyn RowStore>,
        txn_store: Arc<TxnStore>,
        resolver: Arc<dyn ReadResolver>,
    ) -> Self {
        let reader = SnapshotReader::new(
            Arc::clone(&row_store),
            Arc::clone(&txn_store),
            Arc::clone(&resolver),
        );
        Self {
            row_store,
            txn_store,
            resolver,
            reader,
            write_sets: RwLock::new(HashMap::new()),
            not_null: Vec::new(),
        }
    }

    /// Declare NOT NULL columns, each with the constraint name to report.
    pub fn with_not_null(mut self, columns: Vec<(ColumnId, String)>) -> Self {
        self.not_null = columns;
        self
    }

    /// Rows currently staged by the given transaction.
    pub fn staged_rows(&self, txn_id: TxnId) -> usize {
        self.write_sets.read().get(&txn_id).map_or(0, HashSet::len)
    }

    /// Stage one mutation for the view's transaction.
    pub fn stage(&self, view: &TxnView, mutation: Mutation) -> Result<()> {
        let txn_id = view.txn_id();
        let record = self
            .txn_store
            .get(txn_id)?
            .ok_or(SiError::TransactionNotFound(txn_id))?;
        if record.status != TxnStatus::Active {
            return Err(SiError::InvalidState {
                txn_id,
                status: record.status.to_string(),
                action: "stage writes".into(),
            });
        }
        if !record.writable {
            return Err(SiError::Lifecycle(format!(
                "Transaction {txn_id} was not elevated for writing"
            )));
        }

        self.check_not_null(&mutation.op)?;

        let row = mutation.row.as_slice();
        if !matches!(mutation.op, MutationOp::AdjustFkCounter { .. }) {
            self.screen_conflicts(row, view)?;
        }

        let opts = ReadOptions::default();
        let mut puts: Vec<RawCell> = Vec::new();
        match &mutation.op {
            MutationOp::Insert(payload) => {
                match self.reader.read_row_state(row, view, &opts)? {
                    RowState::Live(_) => {
                        return Err(SiError::PrimaryKeyViolation {
                            constraint: PRIMARY_KEY.into(),
                            row: row.to_vec(),
                        });
                    }
                    RowState::Deleted => {
                        // Revive the row so the tombstone stops cutting
                        // history at this version
                        puts.push(RawCell::new(row, QUAL_TOMBSTONE, txn_id, ANTI_TOMBSTONE_VALUE));
                    }
                    RowState::Missing => {}
                }
                puts.push(RawCell::new(row, QUAL_USER_DATA, txn_id, payload.to_bytes()?));
            }
            MutationOp::Update(payload) => {
                puts.push(RawCell::new(row, QUAL_USER_DATA, txn_id, payload.to_bytes()?));
            }
            MutationOp::Delete => {
                let counter = self.reader.read_fk_counter(row, view, &opts)?;
                if counter.total > 0 {
                    return Err(SiError::ForeignKeyViolation {
                        constraint: counter
                            .constraint
                            .unwrap_or_else(|| "FOREIGN KEY".into()),
                        row: row.to_vec(),
                    });
                }
                puts.push(RawCell::new(row, QUAL_TOMBSTONE, txn_id, TOMBSTONE_VALUE));
            }
            MutationOp::InsertUnique { constraint, payload } => {
                match self.reader.read_row_state(row, view, &opts)? {
                    RowState::Live(_) => {
                        return Err(SiError::UniqueViolation {
                            constraint: constraint.clone(),
                            row: row.to_vec(),
                        });
                    }
                    RowState::Deleted => {
                        puts.push(RawCell::new(row, QUAL_TOMBSTONE, txn_id, ANTI_TOMBSTONE_VALUE));
                    }
                    RowState::Missing => {}
                }
                puts.push(RawCell::new(row, QUAL_USER_DATA, txn_id, payload.to_bytes()?));
            }
            MutationOp::AdjustFkCounter { constraint, delta } => {
                // A new reference needs a visible parent row to point at
                if *delta > 0
                    && !matches!(self.reader.read_row_state(row, view, &opts)?, RowState::Live(_))
                {
                    return Err(SiError::ForeignKeyViolation {
                        constraint: constraint.clone(),
                        row: row.to_vec(),
                    });
                }
                puts.push(RawCell::new(
                    row,
                    QUAL_FK_COUNTER,
                    txn_id,
                    cell::encode_fk_delta(*delta, constraint),
                ));
            }
        }

        self.row_store.put_cells(&puts)?;

        // Counter deltas are commutative, so counter rows stay out of the
        // write set and out of commit validation
        if !matches!(mutation.op, MutationOp::AdjustFkCounter { .. }) {
            self.write_sets
                .write()
                .entry(txn_id)
                .or_default()
                .insert(mutation.row);
        }
        Ok(())
    }

    /// Delete every cell the transaction staged on rows in its write set.
    /// Counter cells are left for the read resolver to clean lazily.
    pub fn discard(&self, txn_id: TxnId) -> Result<usize> {
        let rows = self
            .write_sets
            .write()
            .remove(&txn_id)
            .unwrap_or_default();

        let mut deletes: Vec<(Vec<u8>, u8, Timestamp)> = Vec::new();
        for row in &rows {
            for staged in self.row_store.scan_row(row, &ReadOptions::default())? {
                if staged.ts == txn_id {
                    deletes.push((staged.row, staged.qualifier, staged.ts));
                }
            }
        }

        let count = deletes.len();
        if count > 0 {
            self.row_store.delete_cells(&deletes)?;
        }
        Ok(count)
    }

    fn check_not_null(&self, op: &MutationOp) -> Result<()> {
        let (payload, require_present) = match op {
            MutationOp::Insert(payload) | MutationOp::InsertUnique { payload, .. } => {
                (payload, true)
            }
            MutationOp::Update(payload) => (payload, false),
            MutationOp::Delete | MutationOp::AdjustFkCounter { .. } => return Ok(()),
        };
        for (column, constraint) in &self.not_null {
            let violated = match payload.get(*column) {
                Some(ColumnValue::Null) => true,
                None => require_present,
                Some(ColumnValue::Value(_)) => false,
            };
            if violated {
                return Err(SiError::NotNullViolation {
                    constraint: constraint.clone(),
                    column: *column,
                });
            }
        }
        Ok(())
    }

    /// Reject staging when the row has a pending writer or a version
    /// committed after this transaction's snapshot.
    fn screen_conflicts(&self, row: &[u8], view: &TxnView) -> Result<()> {
        let cells = self.row_store.scan_row(row, &ReadOptions::default())?;
        let markers = collect_markers(&cells)?;
        let mut dead_cells = false;

        for staged in &cells {
            if !is_conflicting_cell(staged) || view.is_own(staged.ts) {
                continue;
            }
            if let Some(global_commit_ts) = markers.get(&staged.ts) {
                if *global_commit_ts > view.txn_id() {
                    return Err(conflict(view.txn_id(), staged.ts, row));
                }
                continue;
            }
            match self.txn_store.resolve_global(staged.ts)? {
                GlobalState::Committed(global_commit_ts) => {
                    if global_commit_ts > view.txn_id() {
                        return Err(conflict(view.txn_id(), staged.ts, row));
                    }
                }
                GlobalState::Pending => {
                    return Err(conflict(view.txn_id(), staged.ts, row));
                }
                GlobalState::Dead => {
                    dead_cells = true;
                }
            }
        }

        if dead_cells {
            self.resolver.submit(row);
        }
        Ok(())
    }

    fn validate_row(&self, row: &[u8], txn_id: TxnId, lineage: &[TxnId]) -> Result<()> {
        let cells = self.row_store.scan_row(row, &ReadOptions::default())?;
        let markers = collect_markers(&cells)?;

        for staged in &cells {
            if !is_conflicting_cell(staged) || lineage.contains(&staged.ts) {
                continue;
            }
            if let Some(global_commit_ts) = markers.get(&staged.ts) {
                if *global_commit_ts > txn_id {
                    return Err(conflict(txn_id, staged.ts, row));
                }
                continue;
            }

            let mut polls = 0;
            loop {
                match self.txn_store.resolve_global(staged.ts)? {
                    GlobalState::Committed(global_commit_ts) => {
                        if global_commit_ts > txn_id {
                            return Err(conflict(txn_id, staged.ts, row));
                        }
                        break;
                    }
                    GlobalState::Dead => break,
                    GlobalState::Pending => {
                        if !self.pending_peer_is_committing(staged.ts)? {
                            // A still-active peer staged concurrently; its
                            // own validation will see our committed cells
                            break;
                        }
                        polls += 1;
                        if polls > COMMITTING_POLLS {
                            // Racing commit on the same row; concede
                            return Err(conflict(txn_id, staged.ts, row));
                        }
                        std::thread::sleep(COMMITTING_POLL_INTERVAL);
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk a pending writer's chain up to its lowest live transaction and
    /// report whether that transaction is mid-commit.
    fn pending_peer_is_committing(&self, writer: TxnId) -> Result<bool> {
        let mut current = writer;
        loop {
            let record = self
                .txn_store
                .get(current)?
                .ok_or(SiError::TransactionNotFound(current))?;
            match record.status {
                TxnStatus::Active => return Ok(false),
                TxnStatus::Committing => return Ok(true),
                TxnStatus::Committed => match record.parent {
                    Some(parent) => current = parent,
                    None => return Ok(false),
                },
                TxnStatus::RolledBack | TxnStatus::Error => return Ok(false),
            }
        }
    }

    fn lineage_of(&self, txn: &TxnRecord) -> Result<Vec<TxnId>> {
        let mut lineage = vec![txn.txn_id];
        let mut parent = txn.parent;
        while let Some(parent_id) = parent {
            let record = self
                .txn_store
                .get(parent_id)?
                .ok_or(SiError::TransactionNotFound(parent_id))?;
            lineage.push(parent_id);
            parent = record.parent;
        }
        Ok(lineage)
    }
}

impl CommitValidator for WritePath {
    fn validate_commit(&self, txn: &TxnRecord, commit_ts: Timestamp) -> Result<()> {
        let rows = self
            .write_sets
            .write()
            .remove(&txn.txn_id)
            .unwrap_or_default();
        if rows.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Validating {} rows for transaction {} committing at {}",
            rows.len(),
            txn.txn_id,
            commit_ts
        );

        let lineage = self.lineage_of(txn)?;
        for row in &rows {
            self.validate_row(row, txn.txn_id, &lineage)?;
        }
        Ok(())
    }
}

fn conflict(txn_id: TxnId, other: TxnId, row: &[u8]) -> SiError {
    SiError::WriteConflict {
        txn_id,
        other,
        row: row.to_vec(),
    }
}

fn is_conflicting_cell(cell: &RawCell) -> bool {
    // Checkpoints are settled history and counters never conflict
    matches!(
        CellType::classify(cell.qualifier, &cell.value),
        CellType::Tombstone | CellType::AntiTombstone | CellType::UserData
    )
}
