//! Coverage report for the lake.
//!
//! Only Parquet footers and the `timestamp` column are read. Presence is kept
//! per series as a roaring bitmap of bucket ids, so a gap is simply
//! `window - present`, coalesced into contiguous runs.

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use arrow::array::{Array, TimestampMillisecondArray};
use chrono::{DateTime, Utc};
use market_data_ingestor::{
    bucket::{bucket_end_exclusive_utc, bucket_id, bucket_range, bucket_start_utc},
    models::timeframe::Timeframe,
};
use parquet::arrow::{ProjectionMask, arrow_reader::ParquetRecordBatchReaderBuilder};
use roaring::RoaringBitmap;
use serde::Serialize;
use tracing::warn;

use crate::{errors::QueryError, layout::scan_partitions, schema::TIMESTAMP};

/// Resolution at which missing data is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapGranularity {
    /// Every missing bar of the series' own timeframe.
    #[default]
    Bar,
    /// Whole missing monthly partitions. Suited to markets that close.
    Partition,
}

#[derive(Debug, Clone, Default)]
pub struct HealthCheckOptions {
    pub granularity: GapGranularity,
    /// `[start, end)` every series is expected to cover. Without it each series
    /// is checked between its own first and last stored bar.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// A run of missing data, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub partition_count: usize,
    /// Sum of footer row counts of the readable partitions.
    pub row_count_estimate: u64,
    /// Earliest and latest stored bar across all series.
    pub date_range_covered: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub gaps: Vec<Gap>,
    pub unreadable_partitions: Vec<PathBuf>,
}

#[derive(Default)]
struct Coverage {
    bars: RoaringBitmap,
    months: RoaringBitmap,
}

pub fn health_check(root: &Path, options: &HealthCheckOptions) -> Result<HealthReport, QueryError> {
    let partitions = scan_partitions(root).map_err(QueryError::unavailable)?;
    let mut report = HealthReport {
        partition_count: partitions.len(),
        ..HealthReport::default()
    };
    let mut coverage: BTreeMap<(String, Timeframe), Coverage> = BTreeMap::new();

    for (key, path) in partitions {
        let (rows, timestamps) = match read_timestamps(&path) {
            Ok(read) => read,
            Err(reason) => {
                warn!(partition = %path.display(), %reason, "unreadable partition");
                report.unreadable_partitions.push(path);
                continue;
            }
        };
        report.row_count_estimate += rows;

        let series = coverage
            .entry((key.symbol.clone(), key.timeframe))
            .or_default();
        if let Ok(month) = u32::try_from(bucket_id(key.month_start(), Timeframe::ONE_MONTH)) {
            series.months.insert(month);
        }
        for ts in timestamps {
            match u32::try_from(bucket_id(ts, key.timeframe)) {
                Ok(id) => {
                    series.bars.insert(id);
                }
                Err(_) => warn!(partition = %path.display(), %ts, "bucket id out of range"),
            }
            report.date_range_covered = Some(match report.date_range_covered {
                None => (ts, ts),
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
            });
        }
    }

    for ((symbol, timeframe), series) in coverage {
        let (grid, present) = match options.granularity {
            GapGranularity::Bar => (timeframe, &series.bars),
            GapGranularity::Partition => (Timeframe::ONE_MONTH, &series.months),
        };
        let expected = match options.window {
            Some((start, end)) => ids_in(bucket_range(start, end, grid)),
            None => match (present.min(), present.max()) {
                (Some(lo), Some(hi)) => RoaringBitmap::from_iter(lo..=hi),
                _ => RoaringBitmap::new(),
            },
        };
        let missing = expected - present;
        for (start_id, end_id) in runs(&missing) {
            report.gaps.push(Gap {
                symbol: symbol.clone(),
                timeframe,
                start: bucket_start_utc(u64::from(start_id), grid),
                end: bucket_end_exclusive_utc(u64::from(end_id), grid),
            });
        }
    }

    Ok(report)
}

fn ids_in(range: std::ops::Range<u64>) -> RoaringBitmap {
    let start = u32::try_from(range.start).unwrap_or(u32::MAX);
    let end = u32::try_from(range.end).unwrap_or(u32::MAX);
    let mut ids = RoaringBitmap::new();
    ids.insert_range(start..end);
    ids
}

/// Contiguous `(first, last)` id runs, both inclusive.
fn runs(ids: &RoaringBitmap) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for id in ids {
        match out.last_mut() {
            Some((_, last)) if *last + 1 == id => *last = id,
            _ => out.push((id, id)),
        }
    }
    out
}

/// Row count from the footer, without decoding any page.
pub(crate) fn read_footer_rows(path: &Path) -> Result<u64, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| e.to_string())?;
    u64::try_from(builder.metadata().file_metadata().num_rows()).map_err(|e| e.to_string())
}

pub(crate) fn read_timestamps(path: &Path) -> Result<(u64, Vec<DateTime<Utc>>), String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| e.to_string())?;
    let rows = u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);
    let index = builder
        .schema()
        .index_of(TIMESTAMP)
        .map_err(|e| e.to_string())?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
    let reader = builder
        .with_projection(mask)
        .build()
        .map_err(|e| e.to_string())?;

    let mut timestamps = Vec::with_capacity(rows as usize);
    for batch in reader {
        let batch = batch.map_err(|e| e.to_string())?;
        let column = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .ok_or_else(|| format!("`{TIMESTAMP}` is not a millisecond timestamp"))?;
        for row in 0..column.len() {
            if column.is_null(row) {
                return Err(format!("null `{TIMESTAMP}` at row {row}"));
            }
            let millis = column.value(row);
            timestamps.push(
                DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| format!("timestamp {millis}ms out of range"))?,
            );
        }
    }
    Ok((rows, timestamps))
}
