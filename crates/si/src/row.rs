//! Row reconstruction from visible versions.

use basalt_common::Result;

use crate::cell::{self, CellType};
use crate::payload::RowPayload;

/// The logical state of a row at a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowState {
    /// No visible version exists.
    Missing,
    /// The newest visible version is a tombstone.
    Deleted,
    /// The row exists with the layered payload.
    Live(RowPayload),
}

/// Folds visible versions of one row, fed newest first, into a [`RowState`].
///
/// Partial updates only carry the columns they touched, so the accumulator
/// keeps layering older versions underneath until a tombstone or a
/// checkpoint closes the history.
#[derive(Debug, Default)]
pub struct RowAccumulator {
    payload: RowPayload,
    exists: bool,
    deleted: bool,
    complete: bool,
}

impl RowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the next older visible cell.
    pub fn add(&mut self, qualifier: u8, value: &[u8]) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        match CellType::classify(qualifier, value) {
            CellType::UserData => {
                let version = RowPayload::from_bytes(value)?;
                self.payload.fill_from(&version);
                self.exists = true;
            }
            CellType::Tombstone => {
                if self.exists {
                    // The row was rewritten above this tombstone; older
                    // versions must not leak through it
                    self.complete = true;
                } else {
                    self.deleted = true;
                    self.complete = true;
                }
            }
            CellType::AntiTombstone => {
                self.exists = true;
            }
            CellType::Checkpoint => {
                let (_, bytes) = cell::decode_checkpoint(value)?;
                let version = RowPayload::from_bytes(bytes)?;
                self.payload.fill_from(&version);
                self.exists = true;
                self.complete = true;
            }
            CellType::CommitTimestamp | CellType::ForeignKeyCounter | CellType::Other => {}
        }
        Ok(())
    }

    /// True once no older version can change the outcome.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume the accumulated versions into a row state and reset.
    pub fn take_state(&mut self) -> RowState {
        let state = if self.deleted {
            RowState::Deleted
        } else if self.exists {
            RowState::Live(std::mem::take(&mut self.payload))
        } else {
            RowState::Missing
        };
        self.reset();
        state
    }

    pub fn reset(&mut self) {
        self.payload = RowPayload::default();
        self.exists = false;
        self.deleted = false;
        self.complete = false;
    }
}
