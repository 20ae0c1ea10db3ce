use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Store error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("Requested page {0} not found")]
    PageNotFound(u64),
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Page has not enough space
    #[error("Page has not enough space")]
    PageFull,
    /// Unsupported size of key or data
    #[error("Unsupported size of key or data")]
    BadValSize,
    /// Transaction hit an error mid-update and must be aborted
    #[error("Transaction must abort after a failed update")]
    BadTxn,
    /// Operation not allowed in read-only transaction
    #[error("Operation not allowed in read-only transaction")]
    TxnReadOnly,
    /// Environment is already open
    #[error("Environment is already open")]
    EnvAlreadyOpen,
    /// Environment is not initialized
    #[error("Environment is not initialized")]
    EnvNotInitialized,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Environment map size is invalid
    #[error("Invalid map size")]
    EnvInvalidMapSize,
    /// Environment max readers value is invalid
    #[error("Invalid maximum readers value")]
    EnvInvalidMaxReaders,
    /// Page buffer allocation failed
    #[error("Out of memory")]
    OutOfMemory,
    /// Lock is held elsewhere
    #[error("Lock unavailable")]
    Busy,
    /// I/O failure on the data or lock file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
