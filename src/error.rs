//! Error types for setup-time failures.
//!
//! Only configuration and file-level problems are recoverable. Anything that
//! indicates corrupted weights or a broken caller contract during serving
//! panics instead (see the `assert!`s in `cache` and `task`).

use thiserror::Error;

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Expert bundle error: {0}")]
    Bundle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
