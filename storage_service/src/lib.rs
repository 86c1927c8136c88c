//! Partitioned Parquet storage for OHLCV bars.
//!
//! - [`writer::PartitionWriter`] merges validated batches into
//!   `symbol_key=/timeframe=/year=/month=` partitions with last-write-wins
//!   deduplication and atomic replace.
//! - [`catalog::Catalog`] exposes the same files as a read-only SQL table
//!   named `bars`, plus a coverage health check.

pub mod catalog;
pub mod errors;
pub mod health;
pub mod layout;
pub mod schema;
pub mod writer;

pub use catalog::{Catalog, PartitionStats};
pub use errors::{QueryError, StorageError};
pub use writer::{PartitionWriter, WriterConfig};
