//! Error types for the ingestion pipe

use thiserror::Error;

/// Pipe errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{field} is {len} bytes, maximum is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Corrupt segment: {0}")]
    Corrupt(String),

    #[error("Pipe detached: {0}")]
    Detached(String),
}

/// Result type alias for pipe operations
pub type Result<T> = std::result::Result<T, Error>;
