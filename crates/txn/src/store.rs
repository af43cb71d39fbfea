//! Sharded durable transaction store
//!
//! Records are spread across N bucket partitions by `txn_id % N` so no
//! single partition absorbs every write. Enumeration scans all buckets and
//! merges; a record observed in more than one bucket (possible while
//! buckets are being resharded) is deduplicated by keeping whichever copy
//! is furthest along the state machine.
//!
//! Terminal records never change, so they are cached in memory forever.
//! Live records are always re-read from the partition.

use crate::record::{GlobalState, TxnRecord, TxnStatus};
use basalt_common::{Result, SiError, TxnId};
use fjall::{Keyspace, Partition, PartitionCreateOptions};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

pub struct TxnStore {
    keyspace: Keyspace,
    buckets: Vec<Partition>,
    terminal_cache: RwLock<HashMap<TxnId, TxnRecord>>,
}

impl TxnStore {
    /// Open the bucket partitions inside an existing keyspace
    pub fn open(keyspace: Keyspace, bucket_count: u64) -> Result<Self> {
        let bucket_count = bucket_count.max(1);

        let mut buckets = Vec::with_capacity(bucket_count as usize);
        for i in 0..bucket_count {
            let partition = keyspace
                .open_partition(
                    &format!("txn_bucket_{:02}", i),
                    PartitionCreateOptions::default()
                        .block_size(16 * 1024)
                        .compression(fjall::CompressionType::None),
                )
                .map_err(fjall_err)?;
            buckets.push(partition);
        }

        Ok(Self {
            keyspace,
            buckets,
            terminal_cache: RwLock::new(HashMap::new()),
        })
    }

    fn bucket_for(&self, txn_id: TxnId) -> &Partition {
        let index = (txn_id.value() % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }

    /// Persist a record, replacing any prior version
    pub fn put(&self, record: &TxnRecord) -> Result<()> {
        let key = record.txn_id.to_be_bytes().to_vec();
        self.bucket_for(record.txn_id)
            .insert(key, record.to_bytes()?)
            .map_err(fjall_err)?;

        if record.status.is_terminal() {
            // Terminal statuses are decisions; flush the journal promptly
            self.keyspace
                .persist(fjall::PersistMode::Buffer)
                .map_err(fjall_err)?;
            self.terminal_cache
                .write()
                .insert(record.txn_id, record.clone());
        }

        Ok(())
    }

    /// Point lookup of a record
    pub fn get(&self, txn_id: TxnId) -> Result<Option<TxnRecord>> {
        if let Some(record) = self.terminal_cache.read().get(&txn_id) {
            return Ok(Some(record.clone()));
        }

        let Some(bytes) = self
            .bucket_for(txn_id)
            .get(txn_id.to_be_bytes())
            .map_err(fjall_err)?
        else {
            return Ok(None);
        };
        let record = TxnRecord::from_bytes(&bytes)?;

        if record.status.is_terminal() {
            self.terminal_cache.write().insert(txn_id, record.clone());
        }

        Ok(Some(record))
    }

    /// Status of a transaction that must exist
    pub fn status_of(&self, txn_id: TxnId) -> Result<TxnStatus> {
        self.get(txn_id)?
            .map(|r| r.status)
            .ok_or(SiError::TransactionNotFound(txn_id))
    }

    /// Live (ACTIVE or COMMITTING) records with ids in `[min, max]`,
    /// deduplicated and sorted ascending by id
    pub fn active_in_range(&self, min: TxnId, max: TxnId) -> Result<Vec<TxnRecord>> {
        let lo = min.to_be_bytes().to_vec();
        let hi = max.to_be_bytes().to_vec();

        let mut merged: BTreeMap<TxnId, TxnRecord> = BTreeMap::new();
        for bucket in &self.buckets {
            for entry in bucket.range(lo.clone()..=hi.clone()) {
                let (_, value) = entry.map_err(fjall_err)?;
                let record = TxnRecord::from_bytes(&value)?;

                match merged.get(&record.txn_id) {
                    Some(kept) if status_rank(kept.status) >= status_rank(record.status) => {}
                    _ => {
                        merged.insert(record.txn_id, record);
                    }
                }
            }
        }

        Ok(merged
            .into_values()
            .filter(|r| r.status.is_live())
            .collect())
    }

    /// Resolve the global visibility of a writer through its parent chain
    ///
    /// A writer with no record was never allocated here; that is corruption
    /// at the caller's layer, surfaced as `TransactionNotFound`.
    pub fn resolve_global(&self, txn_id: TxnId) -> Result<GlobalState> {
        let Some(record) = self.get(txn_id)? else {
            return Err(SiError::TransactionNotFound(txn_id));
        };

        match record.status {
            TxnStatus::Active | TxnStatus::Committing => Ok(GlobalState::Pending),
            TxnStatus::RolledBack | TxnStatus::Error => Ok(GlobalState::Dead),
            TxnStatus::Committed => match record.global_commit_ts {
                Some(g) => Ok(GlobalState::Committed(g)),
                None => self.resolve_chain(record),
            },
        }
    }

    /// Walk the ancestor chain of a committed child. The chain becomes
    /// visible only once every ancestor has committed, at the root's
    /// commit timestamp.
    fn resolve_chain(&self, mut record: TxnRecord) -> Result<GlobalState> {
        loop {
            let Some(parent_id) = record.parent else {
                // Root of a fully committed chain
                let commit_ts = record.commit_ts.ok_or_else(|| {
                    SiError::Corrupt(format!(
                        "Committed transaction {} has no commit timestamp",
                        record.txn_id
                    ))
                })?;
                return Ok(GlobalState::Committed(commit_ts));
            };

            let Some(parent) = self.get(parent_id)? else {
                return Err(SiError::TransactionNotFound(parent_id));
            };

            match parent.status {
                TxnStatus::Active | TxnStatus::Committing => return Ok(GlobalState::Pending),
                TxnStatus::RolledBack | TxnStatus::Error => return Ok(GlobalState::Dead),
                TxnStatus::Committed => match parent.global_commit_ts {
                    Some(g) => return Ok(GlobalState::Committed(g)),
                    None => record = parent,
                },
            }
        }
    }
}

/// Progress order used when the same id shows up in several buckets
fn status_rank(status: TxnStatus) -> u8 {
    match status {
        TxnStatus::Active => 0,
        TxnStatus::Committing => 1,
        _ => 2,
    }
}

fn fjall_err(e: fjall::Error) -> SiError {
    SiError::Store(e.to_string())
}
