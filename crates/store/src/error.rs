//! Store-local errors

use std::fmt;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the cell store
#[derive(Debug)]
pub enum Error {
    /// Underlying fjall failure
    Fjall(fjall::Error),

    /// Malformed key or value bytes
    Encoding(String),

    /// A scan deadline expired
    Timeout(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fjall(e) => write!(f, "Fjall error: {}", e),
            Error::Encoding(e) => write!(f, "Encoding error: {}", e),
            Error::Timeout(op) => write!(f, "Timed out during {}", op),
        }
    }
}

impl std::error::Error for Error {}

impl From<fjall::Error> for Error {
    fn from(e: fjall::Error) -> Self {
        Error::Fjall(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Fjall(fjall::Error::from(e))
    }
}

impl From<Error> for basalt_common::SiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Timeout(op) => basalt_common::SiError::Timeout(op),
            Error::Encoding(msg) => basalt_common::SiError::Corrupt(msg),
            Error::Fjall(e) => basalt_common::SiError::Store(e.to_string()),
        }
    }
}
