//! Canonical in-memory representation of a time-series bar (OHLCV).
//!
//! This struct is used as the standard output for all [`DataProvider`](crate::providers::DataProvider)
//! implementations, regardless of asset class (stocks, futures, crypto, etc.).

use chrono::{DateTime, Utc};

/// A single time-series bar (OHLCV) for a given timestamp.
///
/// This struct is vendor-agnostic and is used throughout the data ingestion pipeline.
/// Symbol and timeframe live on the enclosing [`BarSeries`](crate::models::bar_series::BarSeries).
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    /// The timestamp for this bar (UTC), i.e. the bucket start.
    pub timestamp: DateTime<Utc>,

    /// Opening price.
    pub open: f64,

    /// Highest price during the bar interval.
    pub high: f64,

    /// Lowest price during the bar interval.
    pub low: f64,

    /// Closing price.
    pub close: f64,

    /// Volume traded during the bar interval.
    pub volume: f64,

    /// Trade count for the bar. Not all providers supply this.
    pub trade_count: Option<u64>,

    /// Volume-weighted average price. Not all providers supply this.
    pub vwap: Option<f64>,
}

impl Bar {
    /// Returns the first sanity rule this bar breaks, if any.
    ///
    /// Prices must be finite, `high` must bound `open`, `close` and `low` from
    /// above, `low` must bound `open`, `close` and `high` from below, and volume
    /// must be finite and non-negative.
    pub fn ohlc_violation(&self) -> Option<&'static str> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Some("non-finite price");
        }
        if self.high < self.open.max(self.close).max(self.low) {
            return Some("high below open/close/low");
        }
        if self.low > self.open.min(self.close).min(self.high) {
            return Some("low above open/close/high");
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Some("negative or non-finite volume");
        }
        if self.vwap.is_some_and(|v| !v.is_finite()) {
            return Some("non-finite vwap");
        }
        None
    }
}
