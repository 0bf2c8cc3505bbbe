//! Error types for the cache engine

use thiserror::Error;

/// Main error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// External data reader error
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    /// The signal is not present in any cache tier yet
    #[error("Signal not yet cached: {0}")]
    UnknownSignal(String),

    /// A request's time range could not be resolved against the signal's known span
    #[error("Unresolved time range: {0}")]
    UnresolvedTimeRange(String),

    /// No data reader is registered for a data source kind
    #[error("No data reader registered for source kind '{0}'")]
    NoReader(String),

    /// Sampling-rate estimation failed
    #[error("Estimation error: {0}")]
    Estimation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid argument passed by a caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking tier task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable tier and persistence errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by external data readers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    /// The remote source could not be reached or answered with an error
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The signal does not describe valid data for this source
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
