mod common;

use chrono::Duration;
use common::{minute_series, utc};
use market_data_ingestor::models::timeframe::Timeframe;
use storage_service::{
    Catalog, PartitionWriter, WriterConfig,
    health::{Gap, GapGranularity, HealthCheckOptions},
    layout::PartitionKey,
};

fn minutes_in(start: chrono::DateTime<chrono::Utc>, end: chrono::DateTime<chrono::Utc>) -> i64 {
    (end - start).num_minutes()
}

async fn march_and_may(dir: &tempfile::TempDir) -> Catalog {
    let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
    let march = utc(2024, 3, 1, 0, 0);
    let april = utc(2024, 4, 1, 0, 0);
    let may = utc(2024, 5, 1, 0, 0);
    let june = utc(2024, 6, 1, 0, 0);
    writer
        .write_series(&minute_series("ETHUSD", march, minutes_in(march, april), 1.0))
        .await
        .unwrap();
    writer
        .write_series(&minute_series("ETHUSD", may, minutes_in(may, june), 1.0))
        .await
        .unwrap();
    Catalog::open(dir.path()).unwrap()
}

#[tokio::test]
async fn missing_month_is_the_only_gap() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = march_and_may(&dir).await;

    let report = catalog
        .health_check(HealthCheckOptions::default())
        .await
        .unwrap();

    assert_eq!(report.partition_count, 2);
    assert_eq!(report.row_count_estimate, (31 + 31) * 24 * 60);
    assert_eq!(
        report.date_range_covered,
        Some((utc(2024, 3, 1, 0, 0), utc(2024, 5, 31, 23, 59)))
    );
    assert_eq!(
        report.gaps,
        vec![Gap {
            symbol: "ETHUSD".into(),
            timeframe: Timeframe::ONE_MINUTE,
            start: utc(2024, 4, 1, 0, 0),
            end: utc(2024, 5, 1, 0, 0),
        }]
    );
    assert!(report.unreadable_partitions.is_empty());
}

#[tokio::test]
async fn partition_granularity_and_window() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = march_and_may(&dir).await;

    let report = catalog
        .health_check(HealthCheckOptions {
            granularity: GapGranularity::Partition,
            window: Some((utc(2024, 2, 1, 0, 0), utc(2024, 7, 1, 0, 0))),
        })
        .await
        .unwrap();
    let spans: Vec<_> = report.gaps.iter().map(|g| (g.start, g.end)).collect();
    assert_eq!(
        spans,
        vec![
            (utc(2024, 2, 1, 0, 0), utc(2024, 3, 1, 0, 0)),
            (utc(2024, 4, 1, 0, 0), utc(2024, 5, 1, 0, 0)),
            (utc(2024, 6, 1, 0, 0), utc(2024, 7, 1, 0, 0)),
        ]
    );
}

#[tokio::test]
async fn unreadable_partitions_are_listed_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path(), WriterConfig::default()).unwrap();
    let start = utc(2024, 8, 1, 0, 0);
    writer
        .write_series(&minute_series("SOLUSD", start, 10, 1.0))
        .await
        .unwrap();
    // a hole inside the stored range
    writer
        .write_series(&minute_series("SOLUSD", start + Duration::minutes(15), 5, 1.0))
        .await
        .unwrap();

    let bad = PartitionKey::for_bar("AAPL", Timeframe::ONE_DAY, start).file_path(dir.path());
    std::fs::create_dir_all(bad.parent().unwrap()).unwrap();
    std::fs::write(&bad, b"nope").unwrap();

    let report = Catalog::open(dir.path())
        .unwrap()
        .health_check(HealthCheckOptions::default())
        .await
        .unwrap();
    assert_eq!(report.partition_count, 2);
    assert_eq!(report.row_count_estimate, 15);
    assert_eq!(report.unreadable_partitions.len(), 1);
    assert!(report.unreadable_partitions[0].ends_with("data.parquet"));
    assert_eq!(report.gaps.len(), 1);
    assert_eq!(report.gaps[0].start, start + Duration::minutes(10));
    assert_eq!(report.gaps[0].end, start + Duration::minutes(15));
}
