//! Snapshot reads over versioned rows.
//!
//! A read folds the visible versions of a row, newest first, into its
//! logical state. Visibility of a version hinges on the writer's effective
//! global commit timestamp: taken from a commit marker when one exists,
//! otherwise resolved through the transaction store and handed to the
//! read resolver for write-back.

use std::collections::HashMap;
use std::sync::Arc;

use basalt_common::{IsolationLevel, Result, SiError, Timestamp, TxnId};
use basalt_store::{RawCell, ReadOptions, RowStore};
use basalt_txn::{GlobalState, TxnStore};

use crate::cell::{self, CellType, QUAL_CHECKPOINT, QUAL_COMMIT_TS};
use crate::payload::RowPayload;
use crate::resolve::ReadResolver;
use crate::row::{RowAccumulator, RowState};

/// A transaction's view of the store: its snapshot timestamp, isolation
/// level, and the chain of ancestors whose writes it always sees.
#[derive(Debug, Clone)]
pub struct TxnView {
    txn_id: TxnId,
    isolation: IsolationLevel,
    lineage: Vec<TxnId>,
}

impl TxnView {
    /// Build the view for a known transaction, walking its parent chain.
    pub fn for_txn(txn_store: &TxnStore, txn_id: TxnId) -> Result<Self> {
        let record = txn_store
            .get(txn_id)?
            .ok_or(SiError::TransactionNotFound(txn_id))?;
        let mut lineage = vec![txn_id];
        let mut parent = record.parent;
        while let Some(parent_id) = parent {
            let ancestor = txn_store
                .get(parent_id)?
                .ok_or(SiError::TransactionNotFound(parent_id))?;
            lineage.push(parent_id);
            parent = ancestor.parent;
        }
        Ok(Self {
            txn_id,
            isolation: record.isolation,
            lineage,
        })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Whether the given writer is this transaction or one of its ancestors.
    pub fn is_own(&self, writer: TxnId) -> bool {
        self.lineage.contains(&writer)
    }

    /// Whether a version committed at `global_commit_ts` is inside this
    /// view's snapshot.
    pub fn sees_committed(&self, global_commit_ts: Timestamp) -> bool {
        match self.isolation {
            IsolationLevel::SnapshotIsolation => global_commit_ts <= self.txn_id,
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => true,
        }
    }
}

/// Observes per-row version counts on the read path, so compaction can
/// target rows that have grown long histories.
pub trait VersionObserver: Send + Sync {
    fn observe(&self, row: &[u8], version_count: usize);
}

/// The visible total of a foreign-key reference counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FkCounter {
    /// Sum of all visible deltas.
    pub total: i64,
    /// Constraint name from the newest visible delta.
    pub constraint: Option<String>,
}

/// Reads rows as of a transaction's snapshot.
pub struct SnapshotReader {
    row_store: Arc<dyn RowStore>,
    txn_store: Arc<TxnStore>,
    resolver: Arc<dyn ReadResolver>,
    observer: Option<Arc<dyn VersionObserver>>,
}

impl SnapshotReader {
    pub fn new(
        row_store: Arc<dyn RowStore>,
        txn_store: Arc<TxnStore>,
        resolver: Arc<dyn ReadResolver>,
    ) -> Self {
        Self {
            row_store,
            txn_store,
            resolver,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn VersionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Read one row at the view's snapshot. Returns `None` for rows that
    /// are missing or deleted as of the snapshot.
    pub fn read_row(
        &self,
        row: &[u8],
        view: &TxnView,
        opts: &ReadOptions,
    ) -> Result<Option<RowPayload>> {
        Ok(match self.read_row_state(row, view, opts)? {
            RowState::Live(payload) => Some(payload),
            RowState::Deleted | RowState::Missing => None,
        })
    }

    /// Like [`read_row`](SnapshotReader::read_row) but keeps deleted rows
    /// distinct from rows that never existed.
    pub fn read_row_state(
        &self,
        row: &[u8],
        view: &TxnView,
        opts: &ReadOptions,
    ) -> Result<RowState> {
        let cells = self.row_store.scan_row(row, opts)?;
        let markers = collect_markers(&cells)?;

        // Scans group cells by qualifier; folding needs strict newest-first
        // order across tombstones, data, and checkpoints
        let mut versions: Vec<&RawCell> = cells
            .iter()
            .filter(|cell| is_version_cell(cell))
            .collect();
        versions.sort_by(|a, b| b.ts.cmp(&a.ts));

        let mut acc = RowAccumulator::new();
        let mut needs_resolution = false;

        for version in &versions {
            if acc.is_complete() {
                break;
            }
            if self.version_visible(version, view, &markers, &mut needs_resolution)? {
                acc.add(version.qualifier, &version.value)?;
            }
        }

        if needs_resolution {
            self.resolver.submit(row);
        }
        if let Some(observer) = &self.observer {
            observer.observe(row, versions.len());
        }

        Ok(acc.take_state())
    }

    /// Sum the visible deltas of a foreign-key counter row.
    pub fn read_fk_counter(
        &self,
        row: &[u8],
        view: &TxnView,
        opts: &ReadOptions,
    ) -> Result<FkCounter> {
        let cells = self.row_store.scan_row(row, opts)?;
        let markers = collect_markers(&cells)?;

        let mut needs_resolution = false;
        let mut total = 0i64;
        let mut constraint: Option<String> = None;

        for candidate in &cells {
            if !matches!(
                CellType::classify(candidate.qualifier, &candidate.value),
                CellType::ForeignKeyCounter
            ) {
                continue;
            }
            if self.version_visible(candidate, view, &markers, &mut needs_resolution)? {
                let (delta, name) = cell::decode_fk_delta(&candidate.value)?;
                total += delta;
                if constraint.is_none() {
                    constraint = Some(name.to_string());
                }
            }
        }

        if needs_resolution {
            self.resolver.submit(row);
        }

        Ok(FkCounter { total, constraint })
    }

    /// Decide visibility of one version cell under the view, noting when
    /// the writer had to be resolved through the transaction store.
    fn version_visible(
        &self,
        version: &RawCell,
        view: &TxnView,
        markers: &HashMap<Timestamp, Timestamp>,
        needs_resolution: &mut bool,
    ) -> Result<bool> {
        if view.is_own(version.ts) {
            return Ok(true);
        }

        // Checkpoints carry their commit timestamp inline
        if version.qualifier == QUAL_CHECKPOINT {
            let (global_commit_ts, _) = cell::decode_checkpoint(&version.value)?;
            return Ok(view.sees_committed(global_commit_ts));
        }

        if let Some(global_commit_ts) = markers.get(&version.ts) {
            return Ok(view.sees_committed(*global_commit_ts));
        }

        match self.txn_store.resolve_global(version.ts)? {
            GlobalState::Committed(global_commit_ts) => {
                // Committed but unmarked; queue the marker write-back
                *needs_resolution = true;
                Ok(view.sees_committed(global_commit_ts))
            }
            GlobalState::Pending => {
                Ok(view.isolation == IsolationLevel::ReadUncommitted)
            }
            GlobalState::Dead => {
                *needs_resolution = true;
                Ok(false)
            }
        }
    }
}

fn is_version_cell(cell: &RawCell) -> bool {
    matches!(
        CellType::classify(cell.qualifier, &cell.value),
        CellType::Tombstone | CellType::AntiTombstone | CellType::UserData | CellType::Checkpoint
    )
}

/// Index the row's commit markers by writer timestamp.
pub(crate) fn collect_markers(cells: &[RawCell]) -> Result<HashMap<Timestamp, Timestamp>> {
    let mut markers = HashMap::new();
    for candidate in cells {
        if candidate.qualifier == QUAL_COMMIT_TS {
            markers.insert(candidate.ts, cell::decode_commit_marker(&candidate.value)?);
        }
    }
    Ok(markers)
}
