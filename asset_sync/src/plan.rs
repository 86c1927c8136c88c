//! Work plan: config entries -> one job per `(symbol, timeframe)`.
//!
//! Entries naming the same series merge into a single job spanning from the
//! earliest start to the latest end, so no two jobs ever write the same
//! partition. Open-ended entries run up to the start of the bucket containing
//! `now` (the still-forming bar is never fetched).
//!
//! Distinct series must also land in distinct partition directories. The
//! directory name keeps the symbol's case, so two symbols that differ only in
//! case would share a directory on a case-insensitive filesystem; such a plan
//! is rejected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, map::Entry};
use market_data_ingestor::{
    bucket::{bucket_id, bucket_start_utc, next_bucket_start},
    models::timeframe::Timeframe,
};
use storage_service::layout::encode_symbol;
use thiserror::Error;

use crate::{
    job::{IngestionJob, SeriesKey},
    spec::{AssetSpec, ProviderId, Range},
};

/// The work plan cannot be built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Two entries ask different upstreams for the same series.
    #[error("{key} is requested from both {first} and {second}")]
    ConflictingProvider {
        /// Series named twice.
        key: SeriesKey,
        /// Provider of the first entry.
        first: ProviderId,
        /// Provider of the conflicting entry.
        second: ProviderId,
    },

    /// Two different series would be written to the same partition directory.
    #[error("{first} and {second} map to the same partition directory")]
    PartitionCollision {
        /// Series seen first.
        first: SeriesKey,
        /// Series that collides with it.
        second: SeriesKey,
    },
}

/// Directory identity of a series on a filesystem that ignores case.
fn directory_of(key: &SeriesKey) -> (String, Timeframe) {
    (encode_symbol(&key.symbol).to_ascii_lowercase(), key.timeframe)
}

fn floor_to_bucket(ts: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
    bucket_start_utc(bucket_id(ts, tf), tf)
}

/// Merge `specs` into jobs, numbered in first-seen order.
pub fn build_plan(specs: &[AssetSpec], now: DateTime<Utc>) -> Result<Vec<IngestionJob>, PlanError> {
    let mut jobs: IndexMap<SeriesKey, IngestionJob> = IndexMap::new();
    let mut directories: HashMap<(String, Timeframe), SeriesKey> = HashMap::new();

    for spec in specs {
        let key = SeriesKey::new(spec.symbol.trim(), spec.timeframe);
        let start = floor_to_bucket(spec.range().start(), spec.timeframe);
        let end = match spec.range() {
            Range::Closed { end, .. } => end,
            Range::Open { .. } => floor_to_bucket(now, spec.timeframe),
        };

        match jobs.entry(key) {
            Entry::Vacant(slot) => {
                let id = slot.index();
                let key = slot.key().clone();
                if let Some(first) = directories.insert(directory_of(&key), key.clone()) {
                    return Err(PlanError::PartitionCollision { first, second: key });
                }
                slot.insert(IngestionJob {
                    id,
                    provider: spec.provider,
                    key,
                    asset_class: spec.asset_class,
                    start,
                    end,
                });
            }
            Entry::Occupied(mut slot) => {
                let job = slot.get_mut();
                if job.provider != spec.provider {
                    return Err(PlanError::ConflictingProvider {
                        key: job.key.clone(),
                        first: job.provider,
                        second: spec.provider,
                    });
                }
                job.start = job.start.min(start);
                job.end = job.end.max(end);
            }
        }
    }

    Ok(jobs.into_values().collect())
}

/// First bucket still to fetch for `job` given its committed cursor.
pub fn resume_point(job: &IngestionJob, committed: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match committed {
        Some(c) => job.start.max(next_bucket_start(c, job.key.timeframe)),
        None => job.start,
    }
}
