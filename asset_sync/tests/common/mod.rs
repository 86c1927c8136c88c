#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use asset_sync::{
    checkpoint::CheckpointStore,
    db::{connection, migrate},
    job::{IngestionJob, SeriesKey},
    orchestrator::{Orchestrator, OrchestratorConfig},
    spec::ProviderId,
    validate::ValidationPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use diesel::{QueryableByName, prelude::*, sql_types::{Integer, Text}};
use market_data_ingestor::{
    models::{
        asset::AssetClass,
        bar::Bar,
        bar_series::BarSeries,
        request_params::{BarsRequestParams, ProviderParams},
        timeframe::Timeframe,
    },
    providers::{ApiSnafu, DataProvider, ProviderError, RateLimitedSnafu},
    rate_limit::{RateGovernor, RequestBudget, RetryPolicy},
};
use storage_service::{PartitionWriter, WriterConfig};
use tempfile::TempDir;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.db").to_string_lossy().to_string();
    migrate::run_sqlite(&path).expect("migrations");
    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal"); // WAL is persistent per DB file

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn t0() -> DateTime<Utc> {
    utc(2024, 1, 1, 0, 0)
}

pub fn minute(n: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(n)
}

/// Deterministic bar for `ts`; the close encodes the minute offset from `t0`.
pub fn synthetic_bar(ts: DateTime<Utc>) -> Bar {
    let close = 100.0 + (ts - t0()).num_minutes() as f64;
    Bar {
        timestamp: ts,
        open: close,
        high: close + 0.5,
        low: close - 0.5,
        close,
        volume: 2.0,
        trade_count: Some(3),
        vwap: Some(close),
    }
}

/// What the scripted upstream does on one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Serve the window from the synthetic minute grid.
    Serve,
    /// Serve, but the third bar has `high < low`.
    Corrupt,
    /// HTTP 429 with no hint.
    Transient,
    /// HTTP 404.
    Permanent,
    /// Never answer.
    Hang,
}

/// Upstream with one-minute bars for every minute of `[t0, available_until)`.
pub struct ScriptedProvider {
    available_until: DateTime<Utc>,
    script: Mutex<VecDeque<Step>>,
    then: Step,
    /// `since` of every call, in order.
    pub calls: Mutex<Vec<DateTime<Utc>>>,
    /// Provider-specific options of every call, in order.
    pub options: Mutex<Vec<ProviderParams>>,
}

impl ScriptedProvider {
    pub fn new(available_until: DateTime<Utc>, script: Vec<Step>, then: Step) -> Arc<Self> {
        Arc::new(Self {
            available_until,
            script: Mutex::new(script.into()),
            then,
            calls: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        })
    }

    pub fn serving(available_until: DateTime<Utc>) -> Arc<Self> {
        Self::new(available_until, vec![], Step::Serve)
    }

    pub fn calls(&self) -> Vec<DateTime<Utc>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn options(&self) -> Vec<ProviderParams> {
        self.options.lock().unwrap().clone()
    }

    fn window(&self, params: &BarsRequestParams) -> Vec<Bar> {
        let end = params
            .until
            .map_or(self.available_until, |u| u.min(self.available_until));
        let mut ts = params.since.max(t0());
        let mut bars = Vec::new();
        while ts < end && bars.len() < params.limit.get() as usize {
            bars.push(synthetic_bar(ts));
            ts += ChronoDuration::minutes(1);
        }
        bars
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_bars(&self, params: &BarsRequestParams) -> Result<BarSeries, ProviderError> {
        self.calls.lock().unwrap().push(params.since);
        self.options
            .lock()
            .unwrap()
            .push(params.provider_specific.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(self.then);
        match step {
            Step::Serve => Ok(BarSeries::new(
                params.symbol.clone(),
                params.timeframe,
                self.window(params),
            )),
            Step::Corrupt => {
                let mut bars = self.window(params);
                if let Some(bar) = bars.get_mut(2) {
                    bar.high = bar.low - 1.0;
                }
                Ok(BarSeries::new(params.symbol.clone(), params.timeframe, bars))
            }
            Step::Transient => RateLimitedSnafu {
                status: 429u16,
                retry_after: None,
            }
            .fail(),
            Step::Permanent => ApiSnafu {
                status: 404u16,
                message: "unknown symbol",
            }
            .fail(),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Governor with a generous budget and millisecond backoff.
pub fn governor(provider: Arc<dyn DataProvider>, max_attempts: u32) -> Arc<RateGovernor> {
    Arc::new(RateGovernor::new(
        provider,
        RequestBudget {
            capacity: NonZeroU32::new(1_000).unwrap(),
            refill_per_second: NonZeroU32::new(1_000).unwrap(),
            call_timeout: Duration::from_secs(30),
        },
        RetryPolicy {
            max_attempts: NonZeroU32::new(max_attempts).unwrap(),
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
    ))
}

pub fn minute_job(id: usize, provider: ProviderId, symbol: &str, minutes: i64) -> IngestionJob {
    IngestionJob {
        id,
        provider,
        key: SeriesKey::new(symbol, Timeframe::ONE_MINUTE),
        asset_class: AssetClass::Crypto,
        start: t0(),
        end: minute(minutes),
    }
}

/// Lake directory plus checkpoint database in one temp dir.
pub struct Lake {
    pub dir: TempDir,
    pub checkpoints: CheckpointStore,
}

impl Lake {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let checkpoints =
            CheckpointStore::open(&dir.path().join("state/checkpoints.db")).expect("open store");
        Self { dir, checkpoints }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("lake")
    }

    pub fn orchestrator(
        &self,
        governors: HashMap<ProviderId, Arc<RateGovernor>>,
        batch_limit: u32,
        validation: ValidationPolicy,
    ) -> Orchestrator {
        let writer = PartitionWriter::new(self.root(), WriterConfig::default()).expect("writer");
        Orchestrator::new(
            governors,
            Arc::new(writer),
            self.checkpoints.clone(),
            OrchestratorConfig {
                max_concurrent_jobs: NonZeroUsize::new(4).unwrap(),
                batch_limit: NonZeroU32::new(batch_limit).unwrap(),
                validation,
            },
        )
    }
}
