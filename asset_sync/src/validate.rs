//! Batch validation between fetch and write.
//!
//! Checks run in this order: schema (symbol and timeframe match the job),
//! OHLC sanity, grid alignment, strictly increasing timestamps not before the
//! requested `since`. Under [`ValidationPolicy::Strict`] the first failure
//! rejects the whole batch; under [`ValidationPolicy::Lenient`] offending bars
//! are dropped and counted. A schema mismatch rejects the batch either way.

use chrono::{DateTime, Utc};
use market_data_ingestor::{
    bucket::is_aligned, errors::IngestionError, models::bar_series::BarSeries,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::IngestionJob;

/// What to do with a batch that fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Reject the batch and fail the job.
    #[default]
    Strict,
    /// Drop offending bars and keep going.
    Lenient,
}

/// A batch that passed validation.
#[derive(Debug)]
pub struct Validated {
    /// Bars safe to hand to the writer.
    pub series: BarSeries,
    /// Bars removed under the lenient policy.
    pub dropped: usize,
}

/// Validate `series`, fetched for `job` starting at `since`.
pub fn validate_batch(
    job: &IngestionJob,
    since: DateTime<Utc>,
    mut series: BarSeries,
    policy: ValidationPolicy,
) -> Result<Validated, IngestionError> {
    if series.symbol != job.key.symbol || series.timeframe != job.key.timeframe {
        let reason = format!(
            "batch is {}/{} but job {} owns {}",
            series.symbol, series.timeframe, job.id, job.key
        );
        warn!(target: "audit", job = job.id, %reason, "validation failed");
        return Err(IngestionError::invalid(reason, None));
    }

    let timeframe = series.timeframe;
    let mut last: Option<DateTime<Utc>> = None;
    let mut kept = Vec::with_capacity(series.bars.len());
    let mut dropped = 0;

    for bar in series.bars.drain(..) {
        let violation = bar
            .ohlc_violation()
            .map(str::to_string)
            .or_else(|| {
                (!is_aligned(bar.timestamp, timeframe))
                    .then(|| format!("timestamp not aligned to {timeframe}"))
            })
            .or_else(|| {
                (bar.timestamp < since).then(|| format!("timestamp before requested start {since}"))
            })
            .or_else(|| {
                last.filter(|prev| bar.timestamp <= *prev)
                    .map(|prev| format!("timestamp not after previous bar {prev}"))
            });

        match violation {
            None => {
                last = Some(bar.timestamp);
                kept.push(bar);
            }
            Some(reason) => {
                warn!(
                    target: "audit",
                    job = job.id,
                    symbol = %job.key.symbol,
                    timeframe = %timeframe,
                    at = %bar.timestamp,
                    %reason,
                    policy = ?policy,
                    "validation failed"
                );
                match policy {
                    ValidationPolicy::Strict => {
                        return Err(IngestionError::invalid(reason, Some(bar.timestamp)));
                    }
                    ValidationPolicy::Lenient => dropped += 1,
                }
            }
        }
    }

    series.bars = kept;
    Ok(Validated { series, dropped })
}
