//! Common error types for the PNCP harvest workspace

use thiserror::Error;

/// Common result type for harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the harvest crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Verdict cache snapshot load/save error
    #[error("Cache snapshot error: {0}")]
    Snapshot(String),

    /// Invalid input or malformed upstream data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
