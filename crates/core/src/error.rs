//! Error types for the tracking core

use thiserror::Error;

/// Core tracking errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(#[from] urltrack_formats::Error),

    #[error("No active file to rotate")]
    NoCurrentFile,

    #[error("Merge error: {0}")]
    Merge(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
