use std::path::PathBuf;

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use parquet::errors::ParquetError;
use thiserror::Error;

/// Failures of the storage writer. Any of them fails only the job that hit it.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The partition already on disk cannot be decoded. It is left untouched.
    #[error("existing partition {} is unreadable: {reason}", path.display())]
    CorruptExisting { path: PathBuf, reason: String },

    /// The partition directory already holds another symbol. Happens when two
    /// symbols differ only in case on a case-insensitive filesystem.
    #[error("partition {} holds {stored:?}, refusing to merge {incoming:?}", path.display())]
    SymbolConflict {
        path: PathBuf,
        stored: String,
        incoming: String,
    },

    #[error("failed to encode partition: {0}")]
    Encode(#[from] ParquetError),

    #[error("failed to build record batch: {0}")]
    Arrow(#[from] ArrowError),
}

/// Failures of catalog reads.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The statement does not plan against the bar schema (unknown column,
    /// incompatible types, syntax, or a non-query statement). Raised before any
    /// file is opened.
    #[error("query does not match the bar schema: {0}")]
    TypeMismatch(#[source] DataFusionError),

    /// Planning succeeded but reading partitions failed.
    #[error("partition data unavailable: {0}")]
    PartitionUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl QueryError {
    pub(crate) fn unavailable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        QueryError::PartitionUnavailable(err.into())
    }
}
