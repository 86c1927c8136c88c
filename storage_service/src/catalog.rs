//! Read-only SQL view over the partitioned lake.
//!
//! Every call plans against a fresh [`SessionContext`] in which the whole
//! data root is registered as the table `bars`: the file columns from
//! [`bar_schema`] (starting with the exact `symbol`) followed by the partition
//! columns `symbol_key`, `timeframe`, `year` and `month` (all strings). Files are listed at execution time, so a
//! query sees exactly the partitions present when it runs.
//!
//! Statements are planned and type-checked before any file is opened. Only
//! queries are accepted; DDL, DML and other statements fail planning.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use datafusion::{
    common::ScalarValue,
    datasource::{
        file_format::parquet::ParquetFormat,
        listing::{ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl},
    },
    execution::context::SQLOptions,
    logical_expr::LogicalPlan,
    prelude::{DataFrame, Expr, SessionContext, col, lit},
};
use market_data_ingestor::models::{bar_series::BarSeries, timeframe::Timeframe};
use tracing::debug;

use crate::{
    errors::QueryError,
    health::{self, HealthCheckOptions, HealthReport, read_footer_rows, read_timestamps},
    layout::{PartitionKey, SYMBOL_KEY_COLUMN, TIMEFRAME_COLUMN, encode_symbol, scan_partitions},
    schema::{
        FILE_COLUMNS, SYMBOL, TIMESTAMP, bar_schema, bars_from_record_batch, partition_columns,
    },
};

/// Name under which the lake is exposed to SQL.
pub const BARS_TABLE: &str = "bars";

/// Size of one partition file as read from its footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub key: PartitionKey,
    pub path: PathBuf,
    /// `None` when the footer cannot be read.
    pub rows: Option<u64>,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    table_url: ListingTableUrl,
}

impl Catalog {
    /// Open the lake at `root`, creating the directory if it does not exist.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, QueryError> {
        fs::create_dir_all(root.as_ref()).map_err(QueryError::unavailable)?;
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(QueryError::unavailable)?;
        // the trailing slash makes the url a directory prefix
        let table_url = ListingTableUrl::parse(format!(
            "{}/",
            root.display().to_string().trim_end_matches('/')
        ))
        .map_err(QueryError::unavailable)?;
        Ok(Self { root, table_url })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session(&self) -> Result<SessionContext, QueryError> {
        let options = ListingOptions::new(Arc::new(ParquetFormat::default()))
            .with_file_extension(".parquet")
            .with_table_partition_cols(partition_columns());
        let config = ListingTableConfig::new(self.table_url.clone())
            .with_listing_options(options)
            .with_schema(bar_schema());
        let table = ListingTable::try_new(config).map_err(QueryError::unavailable)?;

        let ctx = SessionContext::new();
        ctx.register_table(BARS_TABLE, Arc::new(table))
            .map_err(QueryError::unavailable)?;
        Ok(ctx)
    }

    /// Plan and type-check `sql` without reading any partition.
    pub async fn plan(&self, sql: &str) -> Result<LogicalPlan, QueryError> {
        plan_query(&self.session()?, sql).await
    }

    /// Run a read-only SQL query against the `bars` table.
    pub async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>, QueryError> {
        let ctx = self.session()?;
        let plan = plan_query(&ctx, sql).await?;
        debug!(%sql, "executing query");
        let df = ctx
            .execute_logical_plan(plan)
            .await
            .map_err(QueryError::TypeMismatch)?;
        df.collect().await.map_err(QueryError::unavailable)
    }

    /// Bars of one series with `start <= timestamp < end`, ascending.
    pub async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries, QueryError> {
        let ctx = self.session()?;
        let df = ctx
            .table(BARS_TABLE)
            .await
            .and_then(|df| {
                // the key prunes directories, the column is exact
                df.filter(col(SYMBOL_KEY_COLUMN).eq(lit(encode_symbol(symbol))))?
                    .filter(col(SYMBOL).eq(lit(symbol)))?
                    .filter(col(TIMEFRAME_COLUMN).eq(lit(timeframe.to_string())))?
                    .filter(col(TIMESTAMP).gt_eq(timestamp_lit(start)))?
                    .filter(col(TIMESTAMP).lt(timestamp_lit(end)))?
                    .select_columns(&FILE_COLUMNS)?
                    .sort(vec![col(TIMESTAMP).sort(true, false)])
            })
            .map_err(QueryError::TypeMismatch)?;

        let batches = df.collect().await.map_err(QueryError::unavailable)?;
        let mut bars = Vec::new();
        for batch in &batches {
            bars.extend(bars_from_record_batch(batch).map_err(QueryError::unavailable)?);
        }
        Ok(BarSeries::new(symbol, timeframe, bars))
    }

    /// Symbols with at least one partition.
    pub fn symbols(&self) -> Result<Vec<String>, QueryError> {
        let partitions = scan_partitions(&self.root).map_err(QueryError::unavailable)?;
        let symbols: BTreeSet<String> = partitions.into_iter().map(|(key, _)| key.symbol).collect();
        Ok(symbols.into_iter().collect())
    }

    /// Timeframes stored for `symbol`.
    pub fn timeframes(&self, symbol: &str) -> Result<Vec<Timeframe>, QueryError> {
        let partitions = scan_partitions(&self.root).map_err(QueryError::unavailable)?;
        let timeframes: BTreeSet<Timeframe> = partitions
            .into_iter()
            .filter(|(key, _)| key.symbol == symbol)
            .map(|(key, _)| key.timeframe)
            .collect();
        Ok(timeframes.into_iter().collect())
    }

    /// First and last stored bar of one series, `None` when nothing is stored.
    ///
    /// Reads only the timestamp column of the series' partitions.
    pub fn data_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, QueryError> {
        let partitions = scan_partitions(&self.root).map_err(QueryError::unavailable)?;
        let mut range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for (_, path) in partitions
            .iter()
            .filter(|(key, _)| key.symbol == symbol && key.timeframe == timeframe)
        {
            let (_, timestamps) = read_timestamps(path).map_err(|reason| {
                QueryError::unavailable(format!("{}: {reason}", path.display()))
            })?;
            for ts in timestamps {
                range = Some(match range {
                    None => (ts, ts),
                    Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                });
            }
        }
        Ok(range)
    }

    /// Row count and file size of every partition, in key order.
    pub fn partition_stats(&self) -> Result<Vec<PartitionStats>, QueryError> {
        let partitions = scan_partitions(&self.root).map_err(QueryError::unavailable)?;
        partitions
            .into_iter()
            .map(|(key, path)| -> Result<PartitionStats, QueryError> {
                let bytes = fs::metadata(&path).map_err(QueryError::unavailable)?.len();
                let rows = read_footer_rows(&path).ok();
                Ok(PartitionStats {
                    key,
                    path,
                    rows,
                    bytes,
                })
            })
            .collect()
    }

    /// Coverage report over every partition under the root.
    pub async fn health_check(
        &self,
        options: HealthCheckOptions,
    ) -> Result<HealthReport, QueryError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || health::health_check(&root, &options))
            .await
            .map_err(QueryError::unavailable)?
    }
}

async fn plan_query(ctx: &SessionContext, sql: &str) -> Result<LogicalPlan, QueryError> {
    let options = SQLOptions::new()
        .with_allow_ddl(false)
        .with_allow_dml(false)
        .with_allow_statements(false);
    ctx.sql_with_options(sql, options)
        .await
        .and_then(DataFrame::into_optimized_plan)
        .map_err(QueryError::TypeMismatch)
}

fn timestamp_lit(ts: DateTime<Utc>) -> Expr {
    lit(ScalarValue::TimestampMillisecond(
        Some(ts.timestamp_millis()),
        Some("UTC".into()),
    ))
}

/// Format query results as an ASCII table.
pub fn render(batches: &[RecordBatch]) -> Result<String, QueryError> {
    arrow::util::pretty::pretty_format_batches(batches)
        .map(|table| table.to_string())
        .map_err(QueryError::unavailable)
}
