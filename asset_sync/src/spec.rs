//! Declarative specification of *what data to keep fresh*.
//!
//! One [`AssetSpec`] per `[[jobs]]` entry of the config file. Several entries
//! for the same `(symbol, timeframe)` are legal; the planner merges them.

use std::fmt;

use chrono::{DateTime, Utc};
use market_data_ingestor::models::{asset::AssetClass, timeframe::Timeframe};
use serde::{Deserialize, Serialize};

/// Which upstream to use (serde snake_case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Alpaca market data REST API.
    Alpaca,
    /// Binance public klines endpoint.
    Binance,
}

impl ProviderId {
    /// Stable lower-case name, as used in config keys and the checkpoint table.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Alpaca => "alpaca",
            ProviderId::Binance => "binance",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open/closed time range for desired data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    /// Inclusive start, open end (keep fresh up to the last closed bucket).
    Open {
        /// Inclusive start timestamp (UTC).
        start: DateTime<Utc>,
    },

    /// `[start, end)` (backfill only).
    Closed {
        /// Inclusive start timestamp (UTC).
        start: DateTime<Utc>,
        /// Exclusive end timestamp (UTC).
        end: DateTime<Utc>,
    },
}

impl Range {
    /// Inclusive start of the range.
    pub fn start(&self) -> DateTime<Utc> {
        match *self {
            Range::Open { start } | Range::Closed { start, .. } => start,
        }
    }
}

/// One work-plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetSpec {
    /// Upstream that serves the series.
    pub provider: ProviderId,
    /// Symbol as the provider spells it.
    pub symbol: String,
    /// Bar width, e.g. `"1m"`.
    pub timeframe: Timeframe,
    /// Routes the request to the right endpoint where the provider cares.
    #[serde(default)]
    pub asset_class: AssetClass,
    /// Inclusive start (RFC 3339).
    pub start: DateTime<Utc>,
    /// Exclusive end (RFC 3339). Omitted means "up to now".
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl AssetSpec {
    /// The requested window as a [`Range`].
    pub fn range(&self) -> Range {
        match self.end {
            None => Range::Open { start: self.start },
            Some(end) => Range::Closed {
                start: self.start,
                end,
            },
        }
    }
}
