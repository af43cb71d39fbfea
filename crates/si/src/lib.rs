//! Snapshot-isolated row access on top of the transaction core.
//!
//! - Cell model: reserved qualifiers for commit markers, tombstones, user
//!   data, reference counters, and checkpoints
//! - Snapshot reads that layer partial versions and resolve lazily
//!   committed writers
//! - A write path with eager and commit-time first-committer-wins
//!   screening
//! - Checkpoint compaction of row history below the active watermark

pub mod cell;
pub mod checkpoint;
pub mod payload;
pub mod read;
pub mod resolve;
pub mod row;
pub mod write;

pub use cell::CellType;
pub use checkpoint::{CheckpointConfig, CheckpointOutcome, CheckpointRequest, CheckpointResolver};
pub use payload::{ColumnId, ColumnValue, RowPayload};
pub use read::{FkCounter, SnapshotReader, TxnView, VersionObserver};
pub use resolve::{NoopReadResolver, QueuedReadResolver, ReadResolver};
pub use row::{RowAccumulator, RowState};
pub use write::{Mutation, MutationOp, WritePath};
