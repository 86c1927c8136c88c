mod common;

use std::fs;

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use common::{minute_series, utc};
use market_data_ingestor::models::timeframe::Timeframe;
use storage_service::{
    Catalog, PartitionWriter, QueryError, WriterConfig, catalog::render, layout::PartitionKey,
};

async fn seeded_lake() -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
    writer
        .write_series(&minute_series("BTC/USD", utc(2024, 1, 31, 23, 0), 120, 100.0))
        .await
        .unwrap();
    writer
        .write_series(&minute_series("ETHUSD", utc(2024, 1, 15, 0, 0), 30, 10.0))
        .await
        .unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    (dir, catalog)
}

#[tokio::test]
async fn sql_sees_file_and_partition_columns() {
    let (_dir, catalog) = seeded_lake().await;

    let batches = catalog
        .query(
            "SELECT symbol, month, count(*) AS n FROM bars \
             GROUP BY symbol, month ORDER BY symbol, month",
        )
        .await
        .unwrap();
    let batch = &batches[0];
    let symbols = batch
        .column(0)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    let months = batch
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    let counts = batch
        .column(2)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();

    let rows: Vec<(&str, &str, i64)> = (0..batch.num_rows())
        .map(|i| (symbols.value(i), months.value(i), counts.value(i)))
        .collect();
    assert_eq!(
        rows,
        vec![("BTC/USD", "01", 60), ("BTC/USD", "02", 60), ("ETHUSD", "01", 30)]
    );

    let rendered = render(&batches).unwrap();
    assert!(rendered.contains("BTC/USD"));
}

#[tokio::test]
async fn slash_and_dash_symbols_stay_separate() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
    let start = utc(2024, 3, 1, 0, 0);
    writer
        .write_series(&minute_series("BTC/USD", start, 10, 100.0))
        .await
        .unwrap();
    writer
        .write_series(&minute_series("BTC-USD", start, 10, 900.0))
        .await
        .unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();

    let end = utc(2024, 3, 2, 0, 0);
    let slash = catalog.bars("BTC/USD", Timeframe::ONE_MINUTE, start, end).await.unwrap();
    let dash = catalog.bars("BTC-USD", Timeframe::ONE_MINUTE, start, end).await.unwrap();
    assert_eq!(slash.len(), 10);
    assert_eq!(slash.bars[0].close, 100.0);
    assert_eq!(dash.len(), 10);
    assert_eq!(dash.bars[0].close, 900.0);

    let batches = catalog
        .query("SELECT count(*) AS n FROM bars WHERE symbol = 'BTC/USD'")
        .await
        .unwrap();
    let count = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(count.value(0), 10);

    let batches = catalog
        .query("SELECT DISTINCT symbol FROM bars ORDER BY symbol")
        .await
        .unwrap();
    let distinct: Vec<String> = batches
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column(0)
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            (0..column.len()).map(|i| column.value(i).to_string()).collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(distinct, vec!["BTC-USD", "BTC/USD"]);
    assert_eq!(catalog.symbols().unwrap(), vec!["BTC-USD", "BTC/USD"]);
}

#[tokio::test]
async fn bars_returns_the_requested_window_in_order() {
    let (_dir, catalog) = seeded_lake().await;

    // spans the January/February partition boundary
    let series = catalog
        .bars(
            "BTC/USD",
            Timeframe::ONE_MINUTE,
            utc(2024, 1, 31, 23, 50),
            utc(2024, 2, 1, 0, 10),
        )
        .await
        .unwrap();
    assert_eq!(series.len(), 20);
    assert_eq!(series.first_timestamp(), Some(utc(2024, 1, 31, 23, 50)));
    assert_eq!(series.last_timestamp(), Some(utc(2024, 2, 1, 0, 9)));
    assert!(series.bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(series.bars[0].close, 150.0);

    let none = catalog
        .bars("BTC/USD", Timeframe::ONE_HOUR, utc(2024, 1, 1, 0, 0), utc(2024, 3, 1, 0, 0))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn listing_helpers_reflect_disk() {
    let (_dir, catalog) = seeded_lake().await;
    assert_eq!(catalog.symbols().unwrap(), vec!["BTC/USD", "ETHUSD"]);
    assert_eq!(
        catalog.timeframes("BTC/USD").unwrap(),
        vec![Timeframe::ONE_MINUTE]
    );
    assert!(catalog.timeframes("BTC-USD").unwrap().is_empty());
    assert!(catalog.timeframes("DOGE").unwrap().is_empty());
}

#[tokio::test]
async fn data_range_and_partition_stats_read_footers() {
    let (dir, catalog) = seeded_lake().await;

    assert_eq!(
        catalog.data_range("BTC/USD", Timeframe::ONE_MINUTE).unwrap(),
        Some((utc(2024, 1, 31, 23, 0), utc(2024, 2, 1, 0, 59)))
    );
    assert_eq!(
        catalog.data_range("ETHUSD", Timeframe::ONE_MINUTE).unwrap(),
        Some((utc(2024, 1, 15, 0, 0), utc(2024, 1, 15, 0, 29)))
    );
    assert_eq!(catalog.data_range("ETHUSD", Timeframe::ONE_HOUR).unwrap(), None);

    let stats = catalog.partition_stats().unwrap();
    let summary: Vec<(&str, u32, Option<u64>)> = stats
        .iter()
        .map(|s| (s.key.symbol.as_str(), s.key.month, s.rows))
        .collect();
    assert_eq!(
        summary,
        vec![("BTC/USD", 1, Some(60)), ("BTC/USD", 2, Some(60)), ("ETHUSD", 1, Some(30))]
    );
    assert!(stats.iter().all(|s| s.bytes > 0));

    // a broken footer is reported as unknown rows, not an error
    let key = PartitionKey::for_bar("ZZZ", Timeframe::ONE_MINUTE, utc(2024, 1, 1, 0, 0));
    let path = key.file_path(dir.path());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"garbage").unwrap();
    let stats = catalog.partition_stats().unwrap();
    let broken = stats.iter().find(|s| s.key == key).unwrap();
    assert_eq!((broken.rows, broken.bytes), (None, 7));
    assert!(catalog.data_range("ZZZ", Timeframe::ONE_MINUTE).is_err());
}

#[tokio::test]
async fn type_errors_fail_before_touching_storage() {
    let (dir, catalog) = seeded_lake().await;

    // a corrupt partition would fail any scan, so planning must not scan
    let key = PartitionKey::for_bar("ZZZ", Timeframe::ONE_MINUTE, utc(2024, 1, 1, 0, 0));
    let path = key.file_path(dir.path());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"garbage").unwrap();

    for sql in [
        "SELECT no_such_column FROM bars",
        "SELECT close + symbol FROM bars",
        "SELEC close FROM bars",
    ] {
        let err = catalog.query(sql).await.unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch(_)), "{sql}: {err}");
    }
}

#[tokio::test]
async fn mutating_statements_are_rejected() {
    let (_dir, catalog) = seeded_lake().await;
    for sql in [
        "CREATE TABLE t AS SELECT * FROM bars",
        "DROP TABLE bars",
        "INSERT INTO bars SELECT * FROM bars",
        "SET datafusion.execution.batch_size = 1",
    ] {
        let err = catalog.query(sql).await.unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch(_)), "{sql}: {err}");
    }
}

#[tokio::test]
async fn unreadable_partition_fails_execution() {
    let (dir, catalog) = seeded_lake().await;
    let key = PartitionKey::for_bar("ETHUSD", Timeframe::ONE_MINUTE, utc(2024, 2, 1, 0, 0));
    let path = key.file_path(dir.path());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"garbage").unwrap();

    let err = catalog
        .query("SELECT avg(close) FROM bars WHERE symbol = 'ETHUSD'")
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::PartitionUnavailable(_)), "{err}");

    // other series still read fine once the directory key prunes the bad file
    let batches = catalog
        .query("SELECT max(close) AS m FROM bars WHERE symbol_key = 'BTC_2FUSD'")
        .await
        .unwrap();
    let max = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert!(!max.is_null(0));
    assert_eq!(max.value(0), 219.0);
}
