use chrono::DateTime;
use serde::Deserialize;

use crate::{
    models::bar::Bar,
    providers::{MalformedResponseSnafu, ProviderError},
};

/// One kline row. Binance sends a positional array with prices as strings:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trades, taker_base_volume, taker_quote_volume, ignore]`.
#[derive(Deserialize, Debug)]
pub struct Kline(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub serde_json::Value,
);

impl Kline {
    pub fn open_time_ms(&self) -> i64 {
        self.0
    }

    pub fn into_bar(self) -> Result<Bar, ProviderError> {
        let timestamp = DateTime::from_timestamp_millis(self.0).ok_or_else(|| {
            MalformedResponseSnafu {
                message: format!("open time {} out of range", self.0),
            }
            .build()
        })?;
        let volume = decimal("volume", &self.5)?;
        let quote_volume = decimal("quote volume", &self.7)?;
        Ok(Bar {
            timestamp,
            open: decimal("open", &self.1)?,
            high: decimal("high", &self.2)?,
            low: decimal("low", &self.3)?,
            close: decimal("close", &self.4)?,
            volume,
            trade_count: Some(self.8),
            vwap: (volume > 0.0).then(|| quote_volume / volume),
        })
    }
}

/// Error body Binance sends with 4xx responses.
#[derive(Deserialize, Debug)]
pub struct BinanceErrorBody {
    pub code: i64,
    pub msg: String,
}

fn decimal(field: &str, raw: &str) -> Result<f64, ProviderError> {
    raw.parse::<f64>().map_err(|_| {
        MalformedResponseSnafu {
            message: format!("{field} is not a number: {raw:?}"),
        }
        .build()
    })
}
