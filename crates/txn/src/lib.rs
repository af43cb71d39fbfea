//! Transaction records, lifecycle and timestamps for the Basalt core
//!
//! This crate owns everything about a transaction except its data:
//! - The durable `TxnRecord` and its one-directional status machine
//! - The sharded transaction store with terminal-record caching
//! - The timestamp oracle issuing the shared monotone sequence
//! - The lifecycle manager (begin / elevate / commit / rollback / reap)
//!
//! Data cells live in `basalt-store`; the snapshot-isolation read and write
//! paths that join the two live above this crate.

pub mod lifecycle;
pub mod oracle;
pub mod record;
pub mod store;

// Re-export main types
pub use lifecycle::{
    ActionOutcome, CommitValidator, LifecycleAction, LifecycleManager, NoValidation, TxnInfo,
};
pub use oracle::TimestampOracle;
pub use record::{GlobalState, TxnRecord, TxnStatus};
pub use store::TxnStore;
