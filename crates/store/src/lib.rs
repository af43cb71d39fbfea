//! Versioned cell storage for the Basalt transaction core
//!
//! This crate provides the storage substrate the transaction layers build
//! on, backed by Fjall:
//! - Immutable versioned cells addressed by `(row, qualifier, timestamp)`
//! - Newest-first scans with time windows, deadlines and version caps
//! - Atomic put/delete batches
//! - A non-blocking per-row lock table for maintenance work
//!
//! Nothing here knows about transactions. Qualifier bytes and cell values
//! are opaque; their meaning lives in the layers above.

pub mod cell;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod row_store;

// Re-export main types
pub use cell::RawCell;
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use lock::{RowLockGuard, RowLockTable};
pub use row_store::{FjallRowStore, ReadOptions, RowStore};
