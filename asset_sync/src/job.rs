//! Ingestion jobs and their lifecycle.
//!
//! ```text
//! Pending -> Running -> Completed | Failed | PartiallyCompleted | Cancelled
//! ```
//!
//! Every transition is logged at `info` on the `audit` target so an external
//! sink can rebuild the history of a run.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use market_data_ingestor::models::{asset::AssetClass, timeframe::Timeframe};
use serde::Serialize;
use tracing::info;

use crate::spec::ProviderId;

/// `(symbol, timeframe)`: the prefix of the natural key a job owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SeriesKey {
    /// Symbol as the provider spells it.
    pub symbol: String,
    /// Bar width.
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// Key for `symbol` at `timeframe`.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// One unit of work: fetch `[start, end)` of one series from one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionJob {
    /// Position in the plan; used in logs.
    pub id: usize,
    /// Upstream serving the series.
    pub provider: ProviderId,
    /// Series this job owns exclusively.
    pub key: SeriesKey,
    /// Endpoint routing hint passed to the provider.
    pub asset_class: AssetClass,
    /// Inclusive, aligned to a bucket start.
    pub start: DateTime<Utc>,
    /// Exclusive.
    pub end: DateTime<Utc>,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Planned, not started.
    Pending,
    /// Fetching and writing batches.
    Running,
    /// The cursor reached the end of the range.
    Completed,
    /// Stopped on a permanent error, invalid data or a storage failure.
    Failed,
    /// Retry budget ran out after at least one batch was persisted.
    PartiallyCompleted,
    /// Stopped by a shutdown request between batches.
    Cancelled,
}

impl JobState {
    /// Lower-case name, as stored in the checkpoint table.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::PartiallyCompleted => "partially_completed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown job state name.
#[derive(Debug, thiserror::Error)]
#[error("unknown job state `{0}`")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => JobState::Pending,
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "partially_completed" => JobState::PartiallyCompleted,
            "cancelled" => JobState::Cancelled,
            other => return Err(ParseJobStateError(other.to_string())),
        })
    }
}

/// Tracks one job's state and writes the audit trail.
#[derive(Debug)]
pub struct Lifecycle<'a> {
    job: &'a IngestionJob,
    state: JobState,
}

impl<'a> Lifecycle<'a> {
    /// Starts in [`JobState::Pending`].
    pub fn new(job: &'a IngestionJob) -> Self {
        info!(
            target: "audit",
            job = job.id,
            provider = %job.provider,
            symbol = %job.key.symbol,
            timeframe = %job.key.timeframe,
            from = %job.start,
            to = %job.end,
            state = JobState::Pending.as_str(),
            "job planned"
        );
        Self {
            job,
            state: JobState::Pending,
        }
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `next`, logging the transition with the committed cursor.
    pub fn transition(&mut self, next: JobState, cursor: Option<DateTime<Utc>>) {
        debug_assert!(
            !self.state.is_terminal(),
            "job {} left terminal state {}",
            self.job.id,
            self.state
        );
        info!(
            target: "audit",
            job = self.job.id,
            symbol = %self.job.key.symbol,
            timeframe = %self.job.key.timeframe,
            from_state = self.state.as_str(),
            to_state = next.as_str(),
            cursor = ?cursor,
            "job transition"
        );
        self.state = next;
    }
}
