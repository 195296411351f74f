use std::path::PathBuf;

use thiserror::Error;

/// Error type for metadata registry, cache and pruning operations.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: u64, end: u64 },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        file: Option<PathBuf>,
    },

    /// Container payload carried a type tag other than bloom (0x01) or range (0x02).
    #[error("Unknown index container type: {0:#04x}")]
    UnknownContainerType(u8),

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Block {block} has no loaded micro-indices")]
    BlockNotFound { block: u16 },

    #[error("Column {column} has no micro-index in block {block}")]
    ColumnNotFound { block: u16, column: String },

    /// Two registrations for what should have been the same segment carried different keys.
    #[error("Cannot merge segment metadata: left={left}, right={right}")]
    MergeKeyMismatch { left: String, right: String },

    #[error("Empty column name requested for segment {segment}")]
    MissingColumnName { segment: String },

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MetaError {
    /// Shorthand for a [`MetaError::Corruption`] tied to a specific file.
    pub(crate) fn corrupt(details: impl Into<String>, file: Option<PathBuf>) -> Self {
        MetaError::Corruption {
            details: details.into(),
            file,
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for MetaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MetaError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
