//! Background resolution of lazily committed cells.
//!
//! Commits never rewrite staged cells. A reader that had to look a writer
//! up in the transaction store hands the row to a resolver, which writes
//! the missing commit markers back and deletes cells left behind by dead
//! transactions. Later reads of the row then settle on the marker fast
//! path.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use basalt_common::{Result, Timestamp};
use basalt_store::{RawCell, ReadOptions, RowStore};
use basalt_txn::{GlobalState, TxnStore};
use tokio::sync::mpsc;

use crate::cell::{self, CellType, QUAL_COMMIT_TS};

/// Sink for rows that need marker write-back or dead-cell cleanup.
pub trait ReadResolver: Send + Sync {
    /// Queue a row for resolution. Returns false when the submission was
    /// dropped; dropping is always safe because resolution only rewrites
    /// state the read path can reconstruct.
    fn submit(&self, row: &[u8]) -> bool;

    /// Drop all submissions until [`resume`](ReadResolver::resume).
    fn pause(&self);

    fn resume(&self);
}

/// Resolver that discards every submission. Reads stay correct, they just
/// keep paying the transaction-store lookup.
pub struct NoopReadResolver;

impl ReadResolver for NoopReadResolver {
    fn submit(&self, _row: &[u8]) -> bool {
        true
    }

    fn pause(&self) {}

    fn resume(&self) {}
}

/// Resolver backed by a bounded queue and a single worker task.
///
/// Submissions never block: a full queue or a paused resolver drops the
/// row. Must be created inside a tokio runtime.
pub struct QueuedReadResolver {
    tx: mpsc::Sender<Vec<u8>>,
    paused: AtomicBool,
    processed: Arc<AtomicU64>,
}

impl QueuedReadResolver {
    pub fn spawn(
        row_store: Arc<dyn RowStore>,
        txn_store: Arc<TxnStore>,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(queue_depth.max(1));
        let processed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&processed);

        tokio::spawn(async move {
            while let Some(row) = rx.recv().await {
                if let Err(e) = resolve_row(row_store.as_ref(), &txn_store, &row) {
                    tracing::warn!("Read resolution failed for row {:?}: {}", row, e);
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        Arc::new(Self {
            tx,
            paused: AtomicBool::new(false),
            processed,
        })
    }

    /// Rows the worker has taken off the queue, successful or not.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}

impl ReadResolver for QueuedReadResolver {
    fn submit(&self, row: &[u8]) -> bool {
        if self.paused.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.try_send(row.to_vec()).is_ok()
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// Resolve one row synchronously: write commit markers for every committed
/// writer that lacks one and delete cells from rolled-back or failed
/// writers. Idempotent; returns the number of cells written or deleted.
pub fn resolve_row(
    row_store: &dyn RowStore,
    txn_store: &TxnStore,
    row: &[u8],
) -> Result<usize> {
    let cells = row_store.scan_row(row, &ReadOptions::default())?;

    let mut marked: HashSet<Timestamp> = cells
        .iter()
        .filter(|cell| cell.qualifier == QUAL_COMMIT_TS)
        .map(|cell| cell.ts)
        .collect();

    let mut puts: Vec<RawCell> = Vec::new();
    let mut deletes: Vec<(Vec<u8>, u8, Timestamp)> = Vec::new();

    for candidate in &cells {
        match CellType::classify(candidate.qualifier, &candidate.value) {
            CellType::Tombstone
            | CellType::AntiTombstone
            | CellType::UserData
            | CellType::ForeignKeyCounter => {}
            // Markers and checkpoints already carry their commit state
            _ => continue,
        }
        if marked.contains(&candidate.ts) {
            continue;
        }

        match txn_store.resolve_global(candidate.ts)? {
            GlobalState::Committed(global_commit_ts) => {
                puts.push(RawCell::new(
                    row,
                    QUAL_COMMIT_TS,
                    candidate.ts,
                    cell::encode_commit_marker(global_commit_ts),
                ));
                // One marker covers every cell the writer staged here
                marked.insert(candidate.ts);
            }
            GlobalState::Dead => {
                deletes.push((candidate.row.clone(), candidate.qualifier, candidate.ts));
            }
            GlobalState::Pending => {}
        }
    }

    let work = puts.len() + deletes.len();
    if work > 0 {
        row_store.write_batch(&puts, &deletes)?;
        tracing::debug!(
            "Resolved row {:?}: {} markers, {} dead cells",
            row,
            puts.len(),
            deletes.len()
        );
    }
    Ok(work)
}
