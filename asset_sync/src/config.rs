//! Typed settings for one `asset-sync run`.
//!
//! ```toml
//! data_root = "/var/lib/lake"
//! checkpoint_db = "/var/lib/lake/checkpoints.db"
//!
//! [orchestrator]
//! max_concurrent_jobs = 4
//! batch_limit = 1000
//! validation = "strict"
//!
//! [storage]
//! zstd_level = 3
//!
//! [providers.binance]
//! budget = { capacity = 10, refill_per_second = 5, call_timeout_ms = 30000 }
//! retry = { max_attempts = 5, base_delay_ms = 500, multiplier = 2.0, max_delay_ms = 30000, jitter = 0.2 }
//!
//! [providers.alpaca]
//! feed = "iex"
//! adjustment = "split"
//!
//! [[jobs]]
//! provider = "binance"
//! symbol = "BTCUSDT"
//! timeframe = "1m"
//! start = "2024-01-01T00:00:00Z"
//! end = "2024-02-01T00:00:00Z"
//! ```
//!
//! Timestamps are quoted RFC 3339 strings. Alpaca credentials are read from
//! the environment, never from this file.

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use indexmap::IndexMap;
use market_data_ingestor::{
    models::request_params::ProviderParams,
    providers::alpaca_rest::params::{Adjustment, AlpacaBarsParams, Feed},
    rate_limit::{RequestBudget, RetryPolicy},
};
use serde::Deserialize;
use shared_utils::config::{ConfigError, load_toml};

use crate::{spec::AssetSpec, spec::ProviderId, validate::ValidationPolicy};

/// Root of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Directory holding the partitioned lake.
    pub data_root: PathBuf,
    /// SQLite file with the ingest checkpoints.
    pub checkpoint_db: PathBuf,
    /// Concurrency, batch size and validation.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Writer tuning.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Per-provider overrides; providers not listed use defaults.
    #[serde(default)]
    pub providers: IndexMap<ProviderId, ProviderSettings>,
    /// The work plan.
    #[serde(default)]
    pub jobs: Vec<AssetSpec>,
}

/// `[orchestrator]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorSettings {
    /// Jobs in flight at once (`P`).
    pub max_concurrent_jobs: NonZeroUsize,
    /// Bars requested per fetch.
    pub batch_limit: NonZeroU32,
    /// Strict fails the job on a bad batch; lenient drops bad rows.
    pub validation: ValidationPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            batch_limit: NonZeroU32::new(1000).unwrap_or(NonZeroU32::MIN),
            validation: ValidationPolicy::Strict,
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSettings {
    /// ZSTD level for partition files, 1..=22.
    pub zstd_level: i32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { zstd_level: 3 }
    }
}

/// `[providers.<id>]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProviderSettings {
    /// Override of the provider's public endpoint.
    pub base_url: Option<String>,
    /// Token bucket and call timeout.
    pub budget: BudgetSettings,
    /// Backoff policy for transient errors.
    pub retry: RetrySettings,
    /// Alpaca only: stock data feed.
    pub feed: Option<Feed>,
    /// Alpaca only: corporate action adjustment of stock bars.
    pub adjustment: Option<Adjustment>,
    /// Alpaca only: currency of stock prices.
    pub currency: Option<String>,
}

impl ProviderSettings {
    fn has_alpaca_options(&self) -> bool {
        self.feed.is_some() || self.adjustment.is_some() || self.currency.is_some()
    }

    /// Provider-specific options sent with every request to `id`.
    pub fn request_params(&self, id: ProviderId) -> ProviderParams {
        match id {
            ProviderId::Alpaca if self.has_alpaca_options() => {
                ProviderParams::Alpaca(AlpacaBarsParams {
                    adjustment: self.adjustment.clone(),
                    feed: self.feed.clone(),
                    currency: self.currency.clone(),
                })
            }
            _ => ProviderParams::None,
        }
    }
}

/// Token bucket in config units.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BudgetSettings {
    /// Burst size.
    pub capacity: NonZeroU32,
    /// Tokens added per second.
    pub refill_per_second: NonZeroU32,
    /// Per-call deadline in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        let budget = RequestBudget::default();
        Self {
            capacity: budget.capacity,
            refill_per_second: budget.refill_per_second,
            call_timeout_ms: budget.call_timeout.as_millis() as u64,
        }
    }
}

impl From<&BudgetSettings> for RequestBudget {
    fn from(s: &BudgetSettings) -> Self {
        RequestBudget {
            capacity: s.capacity,
            refill_per_second: s.refill_per_second,
            call_timeout: Duration::from_millis(s.call_timeout_ms),
        }
    }
}

/// Retry policy in config units.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    /// Total attempts including the first.
    pub max_attempts: NonZeroU32,
    /// First backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Growth per retry.
    pub multiplier: f64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Fractional jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: s.max_attempts,
            base_delay: Duration::from_millis(s.base_delay_ms),
            multiplier: s.multiplier,
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter: s.jitter,
        }
    }
}

impl Settings {
    /// Load and check a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Settings = load_toml(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings for `provider`, defaults when the file has none.
    pub fn provider(&self, provider: ProviderId) -> ProviderSettings {
        self.providers.get(&provider).cloned().unwrap_or_default()
    }

    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=22).contains(&self.storage.zstd_level) {
            return Err(ConfigError::Invalid(format!(
                "storage.zstd_level must be within 1..=22, got {}",
                self.storage.zstd_level
            )));
        }
        for (id, p) in &self.providers {
            let retry = &p.retry;
            if !(0.0..=1.0).contains(&retry.jitter) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id}.retry.jitter must be within [0, 1]"
                )));
            }
            if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id}.retry.multiplier must be >= 1"
                )));
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id}.retry.max_delay_ms is below base_delay_ms"
                )));
            }
            if *id != ProviderId::Alpaca && p.has_alpaca_options() {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id} does not accept alpaca request options"
                )));
            }
            if p.budget.call_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id}.budget.call_timeout_ms must be positive"
                )));
            }
        }
        for (i, job) in self.jobs.iter().enumerate() {
            if job.symbol.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("jobs[{i}] has an empty symbol")));
            }
            if job.end.is_some_and(|end| end <= job.start) {
                return Err(ConfigError::Invalid(format!(
                    "jobs[{i}] ({} {}) ends before it starts",
                    job.symbol, job.timeframe
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data_ingestor::models::timeframe::Timeframe;
    use shared_utils::config::parse_toml;

    const SAMPLE: &str = r#"
        data_root = "/tmp/lake"
        checkpoint_db = "/tmp/lake/checkpoints.db"

        [orchestrator]
        max_concurrent_jobs = 2
        validation = "lenient"

        [providers.binance]
        base_url = "http://127.0.0.1:9000"
        budget = { capacity = 20, refill_per_second = 10 }
        retry = { max_attempts = 3, jitter = 0.0 }

        [[jobs]]
        provider = "binance"
        symbol = "BTCUSDT"
        timeframe = "1m"
        asset_class = "crypto"
        start = "2024-01-01T00:00:00Z"
        end = "2024-02-01T00:00:00Z"

        [[jobs]]
        provider = "alpaca"
        symbol = "AAPL"
        timeframe = "1d"
        start = "2020-01-01T00:00:00Z"
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let settings: Settings = parse_toml(SAMPLE).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.orchestrator.max_concurrent_jobs.get(), 2);
        assert_eq!(settings.orchestrator.batch_limit.get(), 1000);
        assert_eq!(settings.orchestrator.validation, ValidationPolicy::Lenient);
        assert_eq!(settings.storage.zstd_level, 3);

        let binance = settings.provider(ProviderId::Binance);
        assert_eq!(binance.base_url.as_deref(), Some("http://127.0.0.1:9000"));
        let budget = RequestBudget::from(&binance.budget);
        assert_eq!(budget.capacity.get(), 20);
        assert_eq!(budget.call_timeout, Duration::from_secs(30));
        let retry = RetryPolicy::from(&binance.retry);
        assert_eq!(retry.max_attempts.get(), 3);
        assert_eq!(retry.base_delay, Duration::from_millis(500));

        let alpaca = settings.provider(ProviderId::Alpaca);
        assert!(alpaca.base_url.is_none());

        assert_eq!(settings.jobs.len(), 2);
        assert_eq!(settings.jobs[0].timeframe, Timeframe::ONE_MINUTE);
        assert!(settings.jobs[1].end.is_none());
    }

    #[test]
    fn alpaca_request_options_reach_the_request() {
        let text = format!("{SAMPLE}\n[providers.alpaca]\nfeed = \"iex\"\nadjustment = \"all\"\n");
        let settings: Settings = parse_toml(&text).unwrap();
        settings.validate().unwrap();

        assert_eq!(
            settings.provider(ProviderId::Alpaca).request_params(ProviderId::Alpaca),
            ProviderParams::Alpaca(AlpacaBarsParams {
                adjustment: Some(Adjustment::All),
                feed: Some(Feed::Iex),
                currency: None,
            })
        );
        assert_eq!(
            settings.provider(ProviderId::Binance).request_params(ProviderId::Binance),
            ProviderParams::None
        );
    }

    #[test]
    fn alpaca_options_on_another_provider_are_rejected() {
        let text = SAMPLE.replace("base_url = \"http://127.0.0.1:9000\"", "feed = \"sip\"");
        let settings: Settings = parse_toml(&text).unwrap();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_inverted_range() {
        let text = SAMPLE.replace("end = \"2024-02-01T00:00:00Z\"", "end = \"2023-12-01T00:00:00Z\"");
        let settings: Settings = parse_toml(&text).unwrap();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = format!("{SAMPLE}\nunknown = 1\n");
        // `unknown` lands in the last [[jobs]] table
        assert!(parse_toml::<Settings>(&text).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
