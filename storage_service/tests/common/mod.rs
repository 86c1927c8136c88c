#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use market_data_ingestor::models::{bar::Bar, bar_series::BarSeries, timeframe::Timeframe};

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn bar(ts: DateTime<Utc>, close: f64) -> Bar {
    Bar {
        timestamp: ts,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 10.0,
        trade_count: Some(5),
        vwap: Some(close),
    }
}

/// `count` consecutive one-minute bars from `start`, closes `base, base+1, ...`.
pub fn minute_bars(start: DateTime<Utc>, count: i64, base: f64) -> Vec<Bar> {
    (0..count)
        .map(|i| bar(start + Duration::minutes(i), base + i as f64))
        .collect()
}

pub fn minute_series(symbol: &str, start: DateTime<Utc>, count: i64, base: f64) -> BarSeries {
    BarSeries::new(symbol, Timeframe::ONE_MINUTE, minute_bars(start, count, base))
}
