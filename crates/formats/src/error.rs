//! Error types for record file codecs

use thiserror::Error;

/// Codec errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 8], found: [u8; 8] },

    #[error("Truncated file: {0}")]
    Truncated(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, Error>;
