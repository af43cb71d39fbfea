//! Durable timestamp oracle
//!
//! Hands out the one monotone u64 sequence that begin timestamps,
//! transaction ids and commit timestamps all come from. Ids are reserved
//! ahead in durable blocks: the reservation upper bound is synced to the
//! metadata partition before any id under it is released, so a restart can
//! never reissue an id that might already be in use.

use basalt_common::{Result, SiError, Timestamp};
use fjall::{Keyspace, Partition, PartitionCreateOptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metadata key holding the reservation upper bound
const RESERVATION_KEY: &[u8] = b"_oracle_reserved";

/// Ids reserved per durable write
const RESERVATION_BLOCK: u64 = 4096;

pub struct TimestampOracle {
    keyspace: Keyspace,
    meta: Partition,
    next: AtomicU64,
    reserved_until: AtomicU64,
    reserve_lock: Mutex<()>,
}

impl TimestampOracle {
    /// Open the oracle, resuming past the last durable reservation
    pub fn open(keyspace: Keyspace) -> Result<Self> {
        let meta = keyspace
            .open_partition(
                "_meta",
                PartitionCreateOptions::default()
                    .block_size(16 * 1024)
                    .compression(fjall::CompressionType::None),
            )
            .map_err(oracle_err)?;

        let start = match meta.get(RESERVATION_KEY).map_err(oracle_err)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    SiError::Corrupt("Oracle reservation is not 8 bytes".to_string())
                })?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        };

        let oracle = Self {
            keyspace,
            meta,
            next: AtomicU64::new(start),
            reserved_until: AtomicU64::new(start),
            reserve_lock: Mutex::new(()),
        };
        oracle.extend_reservation(start)?;

        Ok(oracle)
    }

    /// Take the next timestamp; strictly monotone across restarts
    pub fn next_timestamp(&self) -> Result<Timestamp> {
        let v = self.next.fetch_add(1, Ordering::SeqCst);
        if v >= self.reserved_until.load(Ordering::SeqCst) {
            self.extend_reservation(v)?;
        }
        Ok(Timestamp::new(v))
    }

    /// The next value the oracle would hand out
    ///
    /// Every id issued so far is strictly below this, and every future id
    /// is at or above it.
    pub fn current(&self) -> Timestamp {
        Timestamp::new(self.next.load(Ordering::SeqCst))
    }

    /// Make the durable reservation cover `v` before `v` is released
    fn extend_reservation(&self, v: u64) -> Result<()> {
        let _guard = self.reserve_lock.lock();

        // Another caller may have extended while we waited
        if v < self.reserved_until.load(Ordering::SeqCst) {
            return Ok(());
        }

        let reserved = v + RESERVATION_BLOCK;
        self.meta
            .insert(RESERVATION_KEY, reserved.to_be_bytes().to_vec())
            .map_err(oracle_err)?;
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .map_err(oracle_err)?;
        self.reserved_until.store(reserved, Ordering::SeqCst);

        Ok(())
    }
}

fn oracle_err(e: fjall::Error) -> SiError {
    SiError::Store(format!("Oracle metadata: {}", e))
}
