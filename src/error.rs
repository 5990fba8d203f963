//! Error types for pagehash
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using PageHashError
pub type Result<T> = std::result::Result<T, PageHashError>;

/// Unified error type for pagehash operations
#[derive(Debug, Error)]
pub enum PageHashError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // File Errors
    // -------------------------------------------------------------------------
    #[error("Region [{offset}, {offset}+{length}) is outside of file range [0, {size})")]
    OutOfRange { offset: u64, length: usize, size: u64 },

    #[error("Unexpected end of file at offset {offset}: read {read} of {expected} bytes")]
    EndOfFile {
        offset: u64,
        read: usize,
        expected: usize,
    },

    #[error("File {0} is already open")]
    AlreadyOpen(PathBuf),

    #[error("File {0} is not open")]
    NotOpen(PathBuf),

    #[error("File {0} does not exist")]
    FileNotFound(PathBuf),

    #[error("File {0} already exists")]
    FileExists(PathBuf),

    #[error("Invalid file header: {0}")]
    InvalidHeader(String),

    #[error("Asynchronous write failed: {0}")]
    AsyncWrite(String),

    // -------------------------------------------------------------------------
    // Page Cache Errors
    // -------------------------------------------------------------------------
    #[error("Unknown file id {0}")]
    UnknownFile(u32),

    #[error("Page {page} of file {file_id} does not exist")]
    PageNotFound { file_id: u32, page: u64 },

    // -------------------------------------------------------------------------
    // Index Validation Errors
    // -------------------------------------------------------------------------
    #[error("Key size {size} exceeds the allowed maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Entry of {size} bytes does not fit into an empty bucket of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },

    #[error("Key is already present in the bucket")]
    DuplicateKey,

    #[error("Null keys are not supported by index {0}")]
    NullKeyNotSupported(String),

    // -------------------------------------------------------------------------
    // Corruption Errors
    // -------------------------------------------------------------------------
    #[error("Internal state corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PageHashError {
    /// Corruption means the on-disk structure can no longer be trusted.
    /// Callers should abort the enclosing operation and recover the store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PageHashError::Corrupted(_))
    }

    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        PageHashError::Corrupted(msg.into())
    }
}

impl From<bincode::Error> for PageHashError {
    fn from(err: bincode::Error) -> Self {
        PageHashError::Serialization(err.to_string())
    }
}
