//! Durable, idempotent merge of bar batches into monthly partitions.
//!
//! For each partition touched by a batch the writer
//!
//! 1. takes the partition's lock (writes to one partition are serialized,
//!    different partitions proceed in parallel): first an in-process mutex,
//!    then an exclusive advisory lock on `<partition>/.lock`, which also
//!    serializes other writer instances and other processes,
//! 2. reads the existing file, if any, and checks it holds the same symbol,
//! 3. merges on timestamp with the incoming bar winning,
//! 4. writes the sorted result to a temporary sibling, fsyncs it, renames it
//!    over `data.parquet` and fsyncs the directory.
//!
//! Readers therefore see either the old file or the new one, never a mix. An
//! existing file that cannot be decoded fails the write and is left as is.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use market_data_ingestor::models::{bar::Bar, bar_series::BarSeries};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    errors::StorageError,
    layout::{DATA_FILE_NAME, LOCK_FILE_NAME, PartitionKey},
    schema::{bars_from_record_batch, bars_to_record_batch, batch_symbol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// ZSTD level for new files (1..=22).
    pub zstd_level: i32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { zstd_level: 3 }
    }
}

/// Outcome of one partition replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCommit {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub rows_before: usize,
    pub rows_incoming: usize,
    pub rows_after: usize,
    /// Latest timestamp of the incoming bars for this partition.
    pub last_timestamp: DateTime<Utc>,
}

impl PartitionCommit {
    pub fn rows_inserted(&self) -> usize {
        self.rows_after.saturating_sub(self.rows_before)
    }

    /// Incoming rows that overwrote a row with the same timestamp.
    pub fn rows_replaced(&self) -> usize {
        self.rows_incoming.saturating_sub(self.rows_inserted())
    }
}

/// Per-batch summary, partitions in ascending key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub commits: Vec<PartitionCommit>,
}

impl WriteReport {
    pub fn rows_inserted(&self) -> usize {
        self.commits.iter().map(PartitionCommit::rows_inserted).sum()
    }

    pub fn rows_written(&self) -> usize {
        self.commits.iter().map(|c| c.rows_incoming).sum()
    }

    /// Latest bar timestamp now durable on disk from this batch.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.commits.iter().map(|c| c.last_timestamp).max()
    }
}

type PartitionLock = Arc<tokio::sync::Mutex<()>>;

pub struct PartitionWriter {
    root: PathBuf,
    config: WriterConfig,
    locks: Mutex<HashMap<PartitionKey, PartitionLock>>,
}

impl PartitionWriter {
    /// Creates the data root if needed.
    pub fn new(root: impl Into<PathBuf>, config: WriterConfig) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        // reject a bad level up front rather than on the first write
        ZstdLevel::try_new(config.zstd_level)?;
        Ok(Self {
            root,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        key.file_path(&self.root)
    }

    fn lock_for(&self, key: &PartitionKey) -> PartitionLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Forget the partition's mutex once no other commit holds or awaits it.
    fn release(&self, key: &PartitionKey, lock: PartitionLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // owners left: the map and `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn writer_properties(&self) -> Result<WriterProperties, StorageError> {
        Ok(WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(
                self.config.zstd_level,
            )?))
            .build())
    }

    /// Merge `series` into its partitions.
    ///
    /// Partitions are committed one after another in key order, each one
    /// atomically. When a later partition fails the earlier ones stay
    /// committed, which is harmless because re-writing the same bars is a
    /// no-op.
    pub async fn write_series(&self, series: &BarSeries) -> Result<WriteReport, StorageError> {
        let mut grouped: BTreeMap<PartitionKey, Vec<Bar>> = BTreeMap::new();
        for bar in &series.bars {
            grouped
                .entry(PartitionKey::for_bar(
                    &series.symbol,
                    series.timeframe,
                    bar.timestamp,
                ))
                .or_default()
                .push(bar.clone());
        }

        let mut report = WriteReport::default();
        for (key, bars) in grouped {
            report.commits.push(self.commit_partition(key, bars).await?);
        }
        Ok(report)
    }

    async fn commit_partition(
        &self,
        key: PartitionKey,
        bars: Vec<Bar>,
    ) -> Result<PartitionCommit, StorageError> {
        let lock = self.lock_for(&key);
        let guard = Arc::clone(&lock).lock_owned().await;
        let committed = self.replace_locked(key.clone(), bars).await;
        drop(guard);
        self.release(&key, lock);
        committed
    }

    async fn replace_locked(
        &self,
        key: PartitionKey,
        bars: Vec<Bar>,
    ) -> Result<PartitionCommit, StorageError> {
        let path = self.partition_path(&key);
        let props = self.writer_properties()?;
        let rows_incoming = bars.len();
        let last_timestamp = bars
            .iter()
            .map(|b| b.timestamp)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let target = path.clone();
        let symbol = key.symbol.clone();
        let (rows_before, rows_after) =
            tokio::task::spawn_blocking(move || merge_and_replace(&target, &symbol, bars, props))
                .await
                .map_err(|e| StorageError::Io(io::Error::other(e)))??;

        debug!(
            partition = %path.display(),
            rows_before,
            rows_incoming,
            rows_after,
            "partition committed"
        );
        if rows_before == 0 {
            info!(partition = %path.display(), rows_after, "created partition");
        }

        Ok(PartitionCommit {
            key,
            path,
            rows_before,
            rows_incoming,
            rows_after,
            last_timestamp,
        })
    }
}

/// Decode every bar of one partition file.
///
/// Any failure to open or decode the file is reported as
/// [`StorageError::CorruptExisting`] except a missing file, which is an I/O
/// error of kind `NotFound`.
pub fn read_partition(path: &Path) -> Result<Vec<Bar>, StorageError> {
    read_stored(path).map(|(_, bars)| bars)
}

/// Symbol and bars of one partition file.
fn read_stored(path: &Path) -> Result<(Option<String>, Vec<Bar>), StorageError> {
    let file = File::open(path)?;
    let corrupt = |reason: String| StorageError::CorruptExisting {
        path: path.to_path_buf(),
        reason,
    };

    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|e| corrupt(e.to_string()))?;

    let mut symbol: Option<String> = None;
    let mut bars = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| corrupt(e.to_string()))?;
        if let Some(found) = batch_symbol(&batch).map_err(corrupt)? {
            if symbol.as_ref().is_some_and(|seen| *seen != found) {
                return Err(corrupt(format!("mixes {found:?} with another symbol")));
            }
            symbol = Some(found);
        }
        bars.extend(bars_from_record_batch(&batch).map_err(corrupt)?);
    }
    Ok((symbol, bars))
}

fn merge_and_replace(
    path: &Path,
    symbol: &str,
    incoming: Vec<Bar>,
    props: WriterProperties,
) -> Result<(usize, usize), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE_NAME))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    // held until the new file is renamed into place
    let _exclusive = lock.write()?;

    let (stored, existing) = match read_stored(path) {
        Ok(read) => read,
        Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => (None, Vec::new()),
        Err(e) => return Err(e),
    };
    if let Some(stored) = stored.filter(|s| s != symbol) {
        return Err(StorageError::SymbolConflict {
            path: path.to_path_buf(),
            stored,
            incoming: symbol.to_string(),
        });
    }
    let rows_before = existing.len();

    let mut merged: BTreeMap<i64, Bar> = existing
        .into_iter()
        .map(|b| (b.timestamp.timestamp_millis(), b))
        .collect();
    for bar in incoming {
        merged.insert(bar.timestamp.timestamp_millis(), bar);
    }
    let rows: Vec<Bar> = merged.into_values().collect();

    let batch = bars_to_record_batch(symbol, &rows)?;
    write_atomically(path, &batch, props)?;
    Ok((rows_before, rows.len()))
}

fn write_atomically(
    path: &Path,
    batch: &arrow::record_batch::RecordBatch,
    props: WriterProperties,
) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{DATA_FILE_NAME}.{}.tmp", Uuid::new_v4()));

    let written = (|| -> Result<(), StorageError> {
        let file = File::create(&tmp)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use market_data_ingestor::models::timeframe::Timeframe;

    fn bar(ts: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trade_count: None,
            vwap: None,
        }
    }

    #[tokio::test]
    async fn leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let series = BarSeries::new("SPY", Timeframe::ONE_DAY, vec![bar(ts, 1.0)]);

        let report = writer.write_series(&series).await.unwrap();
        assert_eq!(report.commits.len(), 1);
        let partition_dir = report.commits[0].path.parent().unwrap().to_path_buf();
        let mut names: Vec<String> = fs::read_dir(partition_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![LOCK_FILE_NAME.to_string(), DATA_FILE_NAME.to_string()]);
    }

    #[tokio::test]
    async fn duplicate_timestamps_in_one_batch_keep_the_last() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let series = BarSeries::new(
            "SPY",
            Timeframe::ONE_DAY,
            vec![bar(ts, 1.0), bar(ts, 2.0)],
        );

        let report = writer.write_series(&series).await.unwrap();
        assert_eq!(report.commits[0].rows_after, 1);
        assert_eq!(report.commits[0].rows_replaced(), 1);
        let stored = read_partition(&report.commits[0].path).unwrap();
        assert_eq!(stored, vec![bar(ts, 2.0)]);
    }

    #[test]
    fn row_counts_never_underflow() {
        let commit = PartitionCommit {
            key: PartitionKey::for_bar(
                "SPY",
                Timeframe::ONE_DAY,
                Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            ),
            path: PathBuf::from("data.parquet"),
            rows_before: 10,
            rows_incoming: 2,
            rows_after: 4,
            last_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        };
        assert_eq!(commit.rows_inserted(), 0);
        assert_eq!(commit.rows_replaced(), 2);
        assert_eq!(
            WriteReport {
                commits: vec![commit]
            }
            .rows_inserted(),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn partition_mutexes_are_dropped_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let tasks: Vec<_> = (0..12i64)
            .map(|i| {
                let writer = Arc::clone(&writer);
                // three symbols, each batch spans two monthly partitions
                let symbol = ["SPY", "QQQ", "IWM"][(i % 3) as usize];
                let bars = vec![
                    bar(start + chrono::Duration::days(i), i as f64),
                    bar(start + chrono::Duration::days(40 + i), i as f64),
                ];
                tokio::spawn(async move {
                    let series = BarSeries::new(symbol, Timeframe::ONE_DAY, bars);
                    writer.write_series(&series).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(writer.tracked_locks(), 0);

        // also after a failed commit
        let key = PartitionKey::for_bar("BAD", Timeframe::ONE_DAY, start);
        let path = writer.partition_path(&key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"junk").unwrap();
        let series = BarSeries::new("BAD", Timeframe::ONE_DAY, vec![bar(start, 1.0)]);
        assert!(writer.write_series(&series).await.is_err());
        assert_eq!(writer.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn refuses_to_merge_into_another_symbols_partition() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let upper = BarSeries::new("BTCUSD", Timeframe::ONE_DAY, vec![bar(ts, 1.0)]);
        let report = writer.write_series(&upper).await.unwrap();

        // what a case-insensitive filesystem does to `btcusd`
        let lower_key = PartitionKey::for_bar("btcusd", Timeframe::ONE_DAY, ts);
        let lower_path = writer.partition_path(&lower_key);
        fs::create_dir_all(lower_path.parent().unwrap()).unwrap();
        fs::copy(&report.commits[0].path, &lower_path).unwrap();

        let lower = BarSeries::new("btcusd", Timeframe::ONE_DAY, vec![bar(ts, 9.0)]);
        let err = writer.write_series(&lower).await.unwrap_err();
        match err {
            StorageError::SymbolConflict { stored, incoming, .. } => {
                assert_eq!(stored, "BTCUSD");
                assert_eq!(incoming, "btcusd");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(read_partition(&lower_path).unwrap(), vec![bar(ts, 1.0)]);
    }

    #[test]
    fn rejects_invalid_compression_level() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PartitionWriter::new(dir.path(), WriterConfig { zstd_level: 99 }).is_err());
    }
}
