//! Versioned row storage over Fjall
//!
//! Stores immutable cells keyed by `(row, qualifier, timestamp)` and serves
//! them back newest-first. No interpretation of qualifiers or values happens
//! here; the transaction layers above decide what a cell means.

use crate::cell::RawCell;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::keys::{decode_cell_key, encode_cell_key, encode_row_prefix};
use basalt_common::Timestamp;
use fjall::{Keyspace, Partition, PartitionCreateOptions, PersistMode};
use std::time::Instant;

/// Entries scanned between deadline checks
const DEADLINE_CHECK_INTERVAL: usize = 64;

/// Options controlling a versioned scan
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Half-open version window: a cell is included when `lo <= ts < hi`
    pub time_range: (Timestamp, Timestamp),

    /// Scans abandon with a timeout once past this instant
    pub deadline: Option<Instant>,

    /// Cap on versions returned per qualifier (0 = unlimited)
    pub max_versions: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            time_range: (Timestamp::ZERO, Timestamp::MAX),
            deadline: None,
            max_versions: 0,
        }
    }
}

impl ReadOptions {
    /// Restrict the version window
    pub fn with_time_range(mut self, lo: Timestamp, hi: Timestamp) -> Self {
        self.time_range = (lo, hi);
        self
    }

    /// Set a scan deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cap versions per qualifier
    pub fn with_max_versions(mut self, max_versions: usize) -> Self {
        self.max_versions = max_versions;
        self
    }
}

/// Storage interface for versioned cells
///
/// Implementations must preserve timestamps exactly and return scan results
/// ordered by row, then qualifier, then timestamp descending.
pub trait RowStore: Send + Sync {
    /// Apply puts and deletes in one atomic batch
    fn write_batch(&self, puts: &[RawCell], deletes: &[(Vec<u8>, u8, Timestamp)]) -> Result<()>;

    /// Scan every cell of one row
    fn scan_row(&self, row: &[u8], opts: &ReadOptions) -> Result<Vec<RawCell>>;

    /// Scan cells across a row range (`start` inclusive, `end` exclusive)
    fn scan_rows(&self, start: &[u8], end: &[u8], opts: &ReadOptions) -> Result<Vec<RawCell>>;

    /// Point lookup of one cell's value
    fn get_cell(&self, row: &[u8], qualifier: u8, ts: Timestamp) -> Result<Option<Vec<u8>>>;

    /// Write cells only
    fn put_cells(&self, cells: &[RawCell]) -> Result<()> {
        self.write_batch(cells, &[])
    }

    /// Delete cells only (deleting a missing cell is a no-op)
    fn delete_cells(&self, cells: &[(Vec<u8>, u8, Timestamp)]) -> Result<()> {
        self.write_batch(&[], cells)
    }
}

/// Fjall-backed row store
///
/// Cells live in one partition under the encoded key scheme from
/// [`crate::keys`]. A second uncompressed `_meta` partition is exposed for
/// small bookkeeping state owned by upper layers.
pub struct FjallRowStore {
    keyspace: Keyspace,
    cells: Partition,
    meta: Partition,
    persist_mode: PersistMode,
}

impl FjallRowStore {
    /// Open (or create) a store at the configured directory
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.block_cache_size)
            .open()?;

        let cells = keyspace.open_partition(
            "cells",
            PartitionCreateOptions::default()
                .block_size(64 * 1024)
                .compression(config.compression),
        )?;

        let meta = keyspace.open_partition(
            "_meta",
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(fjall::CompressionType::None),
        )?;

        Ok(Self {
            keyspace,
            cells,
            meta,
            persist_mode: config.persist_mode,
        })
    }

    /// Get the keyspace (for co-located partitions)
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Get the metadata partition
    pub fn meta_partition(&self) -> &Partition {
        &self.meta
    }

    /// Flush journals at the configured persist mode
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(self.persist_mode)?;
        Ok(())
    }
}

impl RowStore for FjallRowStore {
    fn write_batch(&self, puts: &[RawCell], deletes: &[(Vec<u8>, u8, Timestamp)]) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for cell in puts {
            let key = encode_cell_key(&cell.row, cell.qualifier, cell.ts);
            batch.insert(&self.cells, key, cell.value.clone());
        }

        for (row, qualifier, ts) in deletes {
            let key = encode_cell_key(row, *qualifier, *ts);
            batch.remove(&self.cells, key);
        }

        batch.commit()?;
        self.keyspace.persist(self.persist_mode)?;

        Ok(())
    }

    fn scan_row(&self, row: &[u8], opts: &ReadOptions) -> Result<Vec<RawCell>> {
        let prefix = encode_row_prefix(row);
        collect_cells(self.cells.prefix(prefix), opts, "row scan")
    }

    fn scan_rows(&self, start: &[u8], end: &[u8], opts: &ReadOptions) -> Result<Vec<RawCell>> {
        let lo = encode_row_prefix(start);
        let hi = encode_row_prefix(end);
        collect_cells(self.cells.range(lo..hi), opts, "range scan")
    }

    fn get_cell(&self, row: &[u8], qualifier: u8, ts: Timestamp) -> Result<Option<Vec<u8>>> {
        let key = encode_cell_key(row, qualifier, ts);
        Ok(self.cells.get(key)?.map(|v| v.to_vec()))
    }
}

impl Drop for FjallRowStore {
    fn drop(&mut self) {
        // Ensure data is persisted on drop
        let _ = self.keyspace.persist(PersistMode::SyncAll);
    }
}

/// Drain a key-ordered fjall iterator into cells, applying scan options
fn collect_cells<K, V, I>(iter: I, opts: &ReadOptions, op: &str) -> Result<Vec<RawCell>>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
    I: Iterator<Item = std::result::Result<(K, V), fjall::Error>>,
{
    let (lo, hi) = opts.time_range;
    let mut cells = Vec::new();
    let mut current: Option<(Vec<u8>, u8)> = None;
    let mut kept = 0usize;

    for (i, entry) in iter.enumerate() {
        if i % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = opts.deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(op.to_string()));
                }
            }
        }

        let (key, value) = entry?;
        let (row, qualifier, ts) = decode_cell_key(key.as_ref())?;

        // The per-qualifier cap resets at each (row, qualifier) boundary
        let same_group = matches!(&current, Some((r, q)) if *r == row && *q == qualifier);
        if !same_group {
            current = Some((row.clone(), qualifier));
            kept = 0;
        }

        if ts < lo || ts >= hi {
            continue;
        }
        if opts.max_versions > 0 && kept >= opts.max_versions {
            continue;
        }

        kept += 1;
        cells.push(RawCell {
            row,
            qualifier,
            ts,
            value: value.as_ref().to_vec(),
        });
    }

    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n)
    }

    fn open_store() -> (FjallRowStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().to_path_buf());
        let store = FjallRowStore::open(&config).unwrap();
        (store, dir)
    }

    #[test]
    fn test_put_and_get_cell() {
        let (store, _dir) = open_store();

        store
            .put_cells(&[RawCell::new(b"row-a".as_slice(), b'7', ts(10), b"v1".as_slice())])
            .unwrap();

        assert_eq!(
            store.get_cell(b"row-a", b'7', ts(10)).unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(store.get_cell(b"row-a", b'7', ts(11)).unwrap(), None);
        assert_eq!(store.get_cell(b"row-b", b'7', ts(10)).unwrap(), None);
    }

    #[test]
    fn test_scan_row_newest_first() {
        let (store, _dir) = open_store();

        for n in [5u64, 20, 10] {
            store
                .put_cells(&[RawCell::new(
                    b"row".as_slice(),
                    b'7',
                    ts(n),
                    n.to_string().into_bytes(),
                )])
                .unwrap();
        }

        let cells = store.scan_row(b"row", &ReadOptions::default()).unwrap();
        let versions: Vec<u64> = cells.iter().map(|c| c.ts.value()).collect();

        assert_eq!(versions, vec![20, 10, 5]);
        assert_eq!(cells[0].value, b"20");
    }

    #[test]
    fn test_scan_row_groups_by_qualifier() {
        let (store, _dir) = open_store();

        store
            .put_cells(&[
                RawCell::new(b"row".as_slice(), b'7', ts(30), b"data".as_slice()),
                RawCell::new(b"row".as_slice(), b'0', ts(30), b"marker".as_slice()),
                RawCell::new(b"row".as_slice(), b'1', ts(40), b"".as_slice()),
            ])
            .unwrap();

        let cells = store.scan_row(b"row", &ReadOptions::default()).unwrap();
        let qualifiers: Vec<u8> = cells.iter().map(|c| c.qualifier).collect();

        assert_eq!(qualifiers, vec![b'0', b'1', b'7']);
    }

    #[test]
    fn test_scan_row_time_range() {
        let (store, _dir) = open_store();

        for n in 1..=5u64 {
            store
                .put_cells(&[RawCell::new(b"row".as_slice(), b'7', ts(n), b"v".as_slice())])
                .unwrap();
        }

        // Half-open window: lo included, hi excluded
        let opts = ReadOptions::default().with_time_range(ts(2), ts(4));
        let cells = store.scan_row(b"row", &opts).unwrap();
        let versions: Vec<u64> = cells.iter().map(|c| c.ts.value()).collect();

        assert_eq!(versions, vec![3, 2]);
    }

    #[test]
    fn test_scan_row_max_versions_per_qualifier() {
        let (store, _dir) = open_store();

        for n in 1..=4u64 {
            store
                .put_cells(&[
                    RawCell::new(b"row".as_slice(), b'7', ts(n), b"d".as_slice()),
                    RawCell::new(b"row".as_slice(), b'0', ts(n), b"m".as_slice()),
                ])
                .unwrap();
        }

        let opts = ReadOptions::default().with_max_versions(2);
        let cells = store.scan_row(b"row", &opts).unwrap();

        // Two newest versions of each qualifier survive the cap
        let kept: Vec<(u8, u64)> = cells.iter().map(|c| (c.qualifier, c.ts.value())).collect();
        assert_eq!(kept, vec![(b'0', 4), (b'0', 3), (b'7', 4), (b'7', 3)]);
    }

    #[test]
    fn test_scan_rows_range_excludes_end() {
        let (store, _dir) = open_store();

        for row in [b"a".as_slice(), b"b", b"c"] {
            store
                .put_cells(&[RawCell::new(row, b'7', ts(1), b"v".as_slice())])
                .unwrap();
        }

        let cells = store
            .scan_rows(b"a", b"c", &ReadOptions::default())
            .unwrap();
        let rows: Vec<&[u8]> = cells.iter().map(|c| c.row.as_slice()).collect();

        assert_eq!(rows, vec![b"a".as_slice(), b"b"]);
    }

    #[test]
    fn test_delete_cells() {
        let (store, _dir) = open_store();

        store
            .put_cells(&[
                RawCell::new(b"row".as_slice(), b'7', ts(1), b"v1".as_slice()),
                RawCell::new(b"row".as_slice(), b'7', ts(2), b"v2".as_slice()),
            ])
            .unwrap();

        store
            .delete_cells(&[(b"row".to_vec(), b'7', ts(1))])
            .unwrap();

        let cells = store.scan_row(b"row", &ReadOptions::default()).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].ts, ts(2));

        // Deleting a cell that does not exist is a no-op
        store
            .delete_cells(&[(b"row".to_vec(), b'7', ts(99))])
            .unwrap();
    }

    #[test]
    fn test_write_batch_applies_puts_and_deletes_together() {
        let (store, _dir) = open_store();

        store
            .put_cells(&[RawCell::new(b"row".as_slice(), b'7', ts(1), b"old".as_slice())])
            .unwrap();

        store
            .write_batch(
                &[RawCell::new(b"row".as_slice(), b'z', ts(1), b"ckpt".as_slice())],
                &[(b"row".to_vec(), b'7', ts(1))],
            )
            .unwrap();

        let cells = store.scan_row(b"row", &ReadOptions::default()).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].qualifier, b'z');
        assert_eq!(cells[0].value, b"ckpt");
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let (store, _dir) = open_store();

        store
            .put_cells(&[RawCell::new(b"row".as_slice(), b'7', ts(1), b"v".as_slice())])
            .unwrap();

        let opts = ReadOptions::default().with_deadline(Instant::now());
        let err = store.scan_row(b"row", &opts).unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_timeout_converts_to_common_error() {
        let err: basalt_common::SiError = Error::Timeout("row scan".to_string()).into();

        assert!(matches!(err, basalt_common::SiError::Timeout(_)));
        assert!(err.can_finitely_retry());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().to_path_buf());

        {
            let store = FjallRowStore::open(&config).unwrap();
            store
                .put_cells(&[RawCell::new(b"row".as_slice(), b'7', ts(5), b"v".as_slice())])
                .unwrap();
        }

        let store = FjallRowStore::open(&config).unwrap();
        assert_eq!(
            store.get_cell(b"row", b'7', ts(5)).unwrap(),
            Some(b"v".to_vec())
        );
    }
}
