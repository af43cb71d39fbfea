//! Common types for the Basalt transaction core
//!
//! This crate defines:
//! - Logical timestamps drawn from the shared oracle sequence
//! - Transaction identifiers (the begin timestamp doubles as the id)
//! - Isolation levels
//! - The error taxonomy and its retry classification

mod error;
mod isolation;
mod timestamp;

pub use error::ErrorTransport;
pub use error::Result;
pub use error::SiError;
pub use isolation::IsolationLevel;
pub use timestamp::Timestamp;
pub use timestamp::TxnId;
