//! Row history compaction.
//!
//! Long row histories are collapsed into a single checkpoint cell holding
//! the layered payload and the commit timestamp of the newest collapsed
//! version. Only versions whose global commit timestamp lies strictly
//! below the watermark, the oldest begin timestamp still active, are
//! touched; every live snapshot reads the same state before and after.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use basalt_common::{Result, SiError, Timestamp};
use basalt_store::{RawCell, ReadOptions, RowLockTable, RowStore};
use basalt_txn::{GlobalState, LifecycleManager, TxnStore};
use parking_lot::Mutex;

use crate::cell::{self, CellType, QUAL_CHECKPOINT, QUAL_COMMIT_TS};
use crate::read::VersionObserver;
use crate::row::{RowAccumulator, RowState};

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Minimum number of collapsible versions before a row is rewritten.
    pub threshold: usize,
    /// Maximum number of rows queued by the version observer.
    pub queue_limit: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            queue_limit: 1024,
        }
    }
}

impl CheckpointConfig {
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
}

/// What a checkpoint attempt did to a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// History was collapsed into a checkpoint cell.
    Written { collapsed: usize },
    /// The row was dead below the watermark; everything was removed.
    Purged { collapsed: usize },
    /// Another worker holds the row; nothing was changed.
    SkippedLocked,
    /// Too few collapsible versions to be worth rewriting.
    SkippedBelowThreshold,
}

/// A row to checkpoint, described as a slice of a shared request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub offset: usize,
    pub len: usize,
}

/// Collapses row histories below the watermark.
///
/// Doubles as the read path's [`VersionObserver`]: rows whose version
/// count crosses the threshold are queued and drained by
/// [`run_pending`](CheckpointResolver::run_pending).
pub struct CheckpointResolver {
    row_store: Arc<dyn RowStore>,
    txn_store: Arc<TxnStore>,
    lifecycle: Arc<LifecycleManager>,
    locks: RowLockTable,
    config: CheckpointConfig,
    pending: Mutex<BTreeSet<Vec<u8>>>,
}

impl CheckpointResolver {
    pub fn new(
        row_store: Arc<dyn RowStore>,
        txn_store: Arc<TxnStore>,
        lifecycle: Arc<LifecycleManager>,
        locks: RowLockTable,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            row_store,
            txn_store,
            lifecycle,
            locks,
            config,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Rows queued by the observer and not yet drained.
    pub fn pending_rows(&self) -> usize {
        self.pending.lock().len()
    }

    /// Checkpoint a single row.
    pub fn checkpoint_row(&self, row: &[u8]) -> Result<CheckpointOutcome> {
        let mut acc = RowAccumulator::new();
        self.checkpoint_row_with(row, &mut acc)
    }

    /// Checkpoint a batch of rows, reusing one accumulator across them.
    pub fn checkpoint_rows(&self, rows: &[Vec<u8>]) -> Result<Vec<CheckpointOutcome>> {
        let mut acc = RowAccumulator::new();
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(self.checkpoint_row_with(row, &mut acc)?);
        }
        Ok(outcomes)
    }

    /// Checkpoint rows handed over as slices of a shared buffer.
    pub fn checkpoint_requests(
        &self,
        buffer: &[u8],
        requests: &[CheckpointRequest],
    ) -> Result<Vec<CheckpointOutcome>> {
        let mut acc = RowAccumulator::new();
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let end = request
                .offset
                .checked_add(request.len)
                .filter(|end| *end <= buffer.len())
                .ok_or_else(|| {
                    SiError::Corrupt(format!(
                        "Checkpoint request at offset {} length {} outside buffer of {} bytes",
                        request.offset,
                        request.len,
                        buffer.len()
                    ))
                })?;
            outcomes.push(self.checkpoint_row_with(&buffer[request.offset..end], &mut acc)?);
        }
        Ok(outcomes)
    }

    /// Drain the observed-row queue.
    pub fn run_pending(&self) -> Result<Vec<CheckpointOutcome>> {
        let rows: Vec<Vec<u8>> = std::mem::take(&mut *self.pending.lock()).into_iter().collect();
        self.checkpoint_rows(&rows)
    }

    fn checkpoint_row_with(
        &self,
        row: &[u8],
        acc: &mut RowAccumulator,
    ) -> Result<CheckpointOutcome> {
        let _guard = match self.locks.try_lock(row) {
            Some(guard) => guard,
            None => return Ok(CheckpointOutcome::SkippedLocked),
        };

        let watermark = self.lifecycle.oldest_active_ts()?;
        let opts = ReadOptions::default().with_time_range(Timestamp::ZERO, watermark);
        let cells = self.row_store.scan_row(row, &opts)?;

        let mut marker_ts: HashSet<Timestamp> = HashSet::new();
        let mut content: Vec<&RawCell> = Vec::new();
        for candidate in &cells {
            match CellType::classify(candidate.qualifier, &candidate.value) {
                CellType::CommitTimestamp => {
                    marker_ts.insert(candidate.ts);
                }
                CellType::Tombstone
                | CellType::AntiTombstone
                | CellType::UserData
                | CellType::Checkpoint => content.push(candidate),
                // Counters are live bookkeeping and never collapse
                CellType::ForeignKeyCounter | CellType::Other => {}
            }
        }
        content.sort_by(|a, b| b.ts.cmp(&a.ts));

        let mut collapsible: Vec<&RawCell> = Vec::new();
        let mut purge_only: Vec<&RawCell> = Vec::new();
        let mut newest_commit: Option<Timestamp> = None;

        for version in &content {
            if version.qualifier == QUAL_CHECKPOINT {
                // An earlier checkpoint was written under an older watermark
                // and stays collapsible under this one
                let (global_commit_ts, _) = cell::decode_checkpoint(&version.value)?;
                newest_commit.get_or_insert(global_commit_ts);
                collapsible.push(version);
                continue;
            }
            match self.txn_store.resolve_global(version.ts)? {
                GlobalState::Committed(global_commit_ts) if global_commit_ts < watermark => {
                    newest_commit.get_or_insert(global_commit_ts);
                    collapsible.push(version);
                }
                // Committed inside some live snapshot, or still undecided
                GlobalState::Committed(_) | GlobalState::Pending => {}
                GlobalState::Dead => purge_only.push(version),
            }
        }

        let collapsed = collapsible.len() + purge_only.len();
        if collapsed < self.config.threshold {
            return Ok(CheckpointOutcome::SkippedBelowThreshold);
        }

        acc.reset();
        for version in &collapsible {
            acc.add(version.qualifier, &version.value)?;
        }
        let state = acc.take_state();
        let checkpoint_ts = collapsible.first().map(|version| version.ts);

        let mut deletes: Vec<(Vec<u8>, u8, Timestamp)> = Vec::new();
        let mut dropped_ts: HashSet<Timestamp> = HashSet::new();
        for version in collapsible.iter().chain(purge_only.iter()) {
            deletes.push((version.row.clone(), version.qualifier, version.ts));
            dropped_ts.insert(version.ts);
        }
        for ts in &dropped_ts {
            if marker_ts.contains(ts) {
                deletes.push((row.to_vec(), QUAL_COMMIT_TS, *ts));
            }
        }

        match (state, checkpoint_ts, newest_commit) {
            (RowState::Live(payload), Some(ts), Some(global_commit_ts)) => {
                // The rewrite may land on the key of an old checkpoint being
                // replaced; inserting wins over a delete of the same key
                deletes.retain(|(_, qualifier, delete_ts)| {
                    !(*qualifier == QUAL_CHECKPOINT && *delete_ts == ts)
                });
                let checkpoint = RawCell::new(
                    row,
                    QUAL_CHECKPOINT,
                    ts,
                    cell::encode_checkpoint(global_commit_ts, &payload.to_bytes()?),
                );
                self.row_store.write_batch(&[checkpoint], &deletes)?;
                tracing::debug!(
                    "Checkpointed row {:?}: collapsed {} versions at {}",
                    row,
                    collapsed,
                    ts
                );
                Ok(CheckpointOutcome::Written { collapsed })
            }
            _ => {
                // Deleted or dead below the watermark: no checkpoint cell,
                // the row simply has no history left down there
                self.row_store.write_batch(&[], &deletes)?;
                tracing::debug!("Purged row {:?}: removed {} versions", row, collapsed);
                Ok(CheckpointOutcome::Purged { collapsed })
            }
        }
    }
}

impl VersionObserver for CheckpointResolver {
    fn observe(&self, row: &[u8], version_count: usize) {
        if version_count < self.config.threshold {
            return;
        }
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.queue_limit {
            return;
        }
        pending.insert(row.to_vec());
    }
}
