//! Per-run outcome reporting.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use market_data_ingestor::models::timeframe::Timeframe;
use serde::Serialize;
use tracing::info;

use crate::{
    job::{IngestionJob, JobState},
    spec::ProviderId,
    tz::to_rfc3339_millis,
};

/// What one job did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    /// Plan position of the job.
    pub job: usize,
    /// Upstream it talked to.
    pub provider: ProviderId,
    /// Series symbol.
    pub symbol: String,
    /// Series timeframe.
    pub timeframe: Timeframe,
    /// Terminal state.
    pub state: JobState,
    /// Timestamp of the last persisted bar, if any was ever persisted.
    pub committed: Option<DateTime<Utc>>,
    /// Batches written during this run.
    pub batches: usize,
    /// Rows handed to the writer during this run.
    pub bars_written: usize,
    /// Rows removed by lenient validation.
    pub rows_dropped: usize,
    /// Why the job did not complete.
    pub error: Option<String>,
}

impl JobReport {
    pub(crate) fn new(job: &IngestionJob, committed: Option<DateTime<Utc>>) -> Self {
        Self {
            job: job.id,
            provider: job.provider,
            symbol: job.key.symbol.clone(),
            timeframe: job.key.timeframe,
            state: JobState::Pending,
            committed,
            batches: 0,
            bars_written: 0,
            rows_dropped: 0,
            error: None,
        }
    }
}

/// Outcome of every job in a run, ordered by job id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// One entry per planned job.
    pub jobs: Vec<JobReport>,
    /// Wall time of the run.
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Number of jobs that ended in `state`.
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    /// True when every job reached the end of its range.
    pub fn all_completed(&self) -> bool {
        self.jobs.iter().all(|j| j.state == JobState::Completed)
    }

    /// Rows written across all jobs.
    pub fn bars_written(&self) -> usize {
        self.jobs.iter().map(|j| j.bars_written).sum()
    }

    /// Report for job `id`.
    pub fn job(&self, id: usize) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.job == id)
    }

    pub(crate) fn log(&self) {
        info!(
            target: "audit",
            jobs = self.jobs.len(),
            completed = self.count(JobState::Completed),
            partially_completed = self.count(JobState::PartiallyCompleted),
            failed = self.count(JobState::Failed),
            cancelled = self.count(JobState::Cancelled),
            bars_written = self.bars_written(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "run finished"
        );
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = [
            "JOB", "PROVIDER", "SERIES", "STATE", "COMMITTED", "BARS", "DROPPED", "ERROR",
        ];
        let rows: Vec<[String; 8]> = self
            .jobs
            .iter()
            .map(|j| {
                [
                    j.job.to_string(),
                    j.provider.to_string(),
                    format!("{}/{}", j.symbol, j.timeframe),
                    j.state.to_string(),
                    j.committed.map_or_else(|| "-".into(), to_rfc3339_millis),
                    j.bars_written.to_string(),
                    j.rows_dropped.to_string(),
                    j.error.clone().unwrap_or_default(),
                ]
            })
            .collect();

        let mut widths = header.map(str::len);
        for row in &rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.len());
            }
        }

        let line = |f: &mut fmt::Formatter<'_>, cells: [&str; 8]| -> fmt::Result {
            let mut out = String::new();
            for (i, cell) in cells.iter().enumerate() {
                if i > 0 {
                    out.push_str("  ");
                }
                out.push_str(&format!("{cell:<width$}", width = widths[i]));
            }
            writeln!(f, "{}", out.trim_end())
        };

        line(f, header)?;
        for row in &rows {
            line(f, row.each_ref().map(String::as_str))?;
        }
        write!(
            f,
            "{} jobs: {} completed, {} partial, {} failed, {} cancelled, {} bars written in {:.1?}",
            self.jobs.len(),
            self.count(JobState::Completed),
            self.count(JobState::PartiallyCompleted),
            self.count(JobState::Failed),
            self.count(JobState::Cancelled),
            self.bars_written(),
            self.elapsed,
        )
    }
}
