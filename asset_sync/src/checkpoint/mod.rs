//! Durable `(symbol, timeframe) -> last committed bar` mapping (SQLite).
//!
//! The committed timestamp only moves forward: it is advanced after a batch is
//! durably written, and a stale value never overwrites a newer one. A restarted
//! run resumes each series from the bucket after its committed timestamp.

mod repo;
mod store;

use chrono::{DateTime, Utc};

pub use repo::SqliteRepo;
pub use store::CheckpointStore;

use crate::{
    job::{JobState, SeriesKey},
    spec::ProviderId,
};

/// Result type used throughout the checkpoint repository for fallible operations.
pub type RepoResult<T> = anyhow::Result<T>;

/// One row of the checkpoint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Series the row belongs to.
    pub key: SeriesKey,
    /// Provider that wrote it last.
    pub provider: String,
    /// Timestamp of the last bar durably persisted; `None` before the first batch.
    pub committed: Option<DateTime<Utc>>,
    /// State of the last job that ran for the series.
    pub state: JobState,
    /// Error text of that job, if it did not complete.
    pub last_error: Option<String>,
    /// Row update time.
    pub updated_at: DateTime<Utc>,
}

/// Portable surface, SQLite implementation lives in `repo.rs`.
pub trait CheckpointRepo {
    /// Every stored checkpoint, ordered by key.
    fn load_all(&self, conn: &mut diesel::SqliteConnection) -> RepoResult<Vec<Checkpoint>>;

    /// The checkpoint of one series, if any.
    fn load(
        &self,
        conn: &mut diesel::SqliteConnection,
        key: &SeriesKey,
    ) -> RepoResult<Option<Checkpoint>>;

    /// Move the committed timestamp to `committed` unless it is already at or
    /// beyond it. Returns the stored value after the call.
    fn advance(
        &self,
        conn: &mut diesel::SqliteConnection,
        key: &SeriesKey,
        provider: ProviderId,
        committed: DateTime<Utc>,
    ) -> RepoResult<DateTime<Utc>>;

    /// Record the job state (and error text) without touching the cursor.
    fn record_state(
        &self,
        conn: &mut diesel::SqliteConnection,
        key: &SeriesKey,
        provider: ProviderId,
        state: JobState,
        last_error: Option<&str>,
    ) -> RepoResult<()>;
}
