//! Store configuration

use std::path::PathBuf;

/// Configuration for the row store and its co-located partitions
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory holding the fjall keyspace
    pub data_dir: PathBuf,

    /// Block cache shared by all partitions (bytes)
    pub block_cache_size: u64,

    /// Compression for the cells partition
    pub compression: fjall::CompressionType,

    /// Journal persistence applied after each batch
    pub persist_mode: fjall::PersistMode,

    /// Bucket partition count for transaction records
    pub txn_buckets: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        // A throwaway directory that outlives the config; callers that care
        // about placement pass their own path through `new`
        let data_dir = tempfile::tempdir()
            .expect("Failed to create temporary directory")
            .keep();

        Self {
            data_dir,
            block_cache_size: 64 * 1024 * 1024,
            compression: fjall::CompressionType::Lz4,
            persist_mode: fjall::PersistMode::Buffer,
            txn_buckets: 16,
        }
    }
}

impl StoreConfig {
    /// Config rooted at the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the block cache size
    pub fn with_block_cache_size(mut self, size: u64) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Set cell compression
    pub fn with_compression(mut self, compression: fjall::CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Set the journal persist mode
    pub fn with_persist_mode(mut self, mode: fjall::PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }

    /// Set the transaction record bucket count (at least one)
    pub fn with_txn_buckets(mut self, buckets: u64) -> Self {
        self.txn_buckets = buckets.max(1);
        self
    }
}
