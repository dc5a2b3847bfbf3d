//! Error types for slidegate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for admission checks and configuration.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Invalid threshold, or a window/precision combination with a negative length
    #[error("Configuration error: {0}")]
    Config(String),

    /// Arguments rejected before or by the admission routine
    #[error("Argument error: {0}")]
    Argument(String),

    /// The store could not be reached or failed to run the routine
    #[error("Transport error: {0}")]
    Transport(#[from] StoreError),

    /// The store replied with something that is not an admission code
    #[error("Type error: {0}")]
    Type(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
