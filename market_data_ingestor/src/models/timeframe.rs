//! Timeframe utilities for expressing uniform bar intervals.
//!
//! A [`Timeframe`] pairs a non-zero amount with a [`TimeframeUnit`], covering
//! minute, hour, day, week (Monday-based), and month buckets in UTC.
//!
//! The canonical text form (`1m`, `15m`, `1h`, `1d`, `1w`, `1mo`) is what ends
//! up in partition directories, checkpoint keys and query results, so it is
//! kept unambiguous on case-insensitive filesystems. Parsing additionally
//! accepts the older upper-case spellings `1D`, `1W` and `1M` (month).
//!
//! ```
//! use market_data_ingestor::models::timeframe::{Timeframe, TimeframeUnit};
//!
//! let tf: Timeframe = "5m".parse().unwrap();
//! assert_eq!(tf.amount().get(), 5);
//! assert_eq!(tf.unit(), TimeframeUnit::Minute);
//! assert_eq!("1M".parse::<Timeframe>().unwrap().to_string(), "1mo");
//! ```

use std::{fmt, num::NonZeroU32, str::FromStr};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bucket::{SECS_PER_DAY, SECS_PER_HOUR, SECS_PER_MINUTE, SECS_PER_WEEK};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeframeError {
    #[error("Invalid amount for {unit:?}: {message}")]
    InvalidAmount { unit: TimeframeUnit, message: String },

    #[error("Invalid timeframe {input:?}: {message}")]
    InvalidInput { input: String, message: String },
}

/// Timeframe granularity (calendar-aware where needed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeframeUnit {
    /// UTC minute
    Minute,
    /// UTC hour
    Hour,
    /// UTC day
    Day,
    /// Monday-based, UTC
    Week,
    /// calendar months, UTC
    Month,
}

/// A timeframe = amount × unit (e.g., 5-Minute, 3-Hour, 2-Week, 6-Month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    amount: NonZeroU32,
    unit: TimeframeUnit,
}

impl Timeframe {
    pub const ONE_MINUTE: Timeframe = Timeframe::new(NonZeroU32::MIN, TimeframeUnit::Minute);
    pub const ONE_HOUR: Timeframe = Timeframe::new(NonZeroU32::MIN, TimeframeUnit::Hour);
    pub const ONE_DAY: Timeframe = Timeframe::new(NonZeroU32::MIN, TimeframeUnit::Day);
    pub const ONE_MONTH: Timeframe = Timeframe::new(NonZeroU32::MIN, TimeframeUnit::Month);

    /// Create a new Timeframe
    pub const fn new(amount: NonZeroU32, unit: TimeframeUnit) -> Self {
        Self { amount, unit }
    }

    pub const fn amount(&self) -> NonZeroU32 {
        self.amount
    }

    pub const fn unit(&self) -> TimeframeUnit {
        self.unit
    }

    /// Width of one bar, or `None` for calendar months whose width varies.
    pub fn fixed_width(&self) -> Option<Duration> {
        let unit_secs = match self.unit {
            TimeframeUnit::Minute => SECS_PER_MINUTE,
            TimeframeUnit::Hour => SECS_PER_HOUR,
            TimeframeUnit::Day => SECS_PER_DAY,
            TimeframeUnit::Week => SECS_PER_WEEK,
            TimeframeUnit::Month => return None,
        };
        Duration::try_seconds(unit_secs * i64::from(self.amount.get()))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.amount.get();
        let u = match self.unit {
            TimeframeUnit::Minute => "m",
            TimeframeUnit::Hour => "h",
            TimeframeUnit::Day => "d",
            TimeframeUnit::Week => "w",
            TimeframeUnit::Month => "mo",
        };
        write!(f, "{a}{u}")
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let invalid = |message: &str| TimeframeError::InvalidInput {
            input: s.to_string(),
            message: message.to_string(),
        };

        let (digits, unit) = if let Some(digits) = input.strip_suffix("mo") {
            (digits, TimeframeUnit::Month)
        } else {
            let last = input.chars().last().ok_or_else(|| invalid("empty timeframe"))?;
            let unit = match last {
                'm' => TimeframeUnit::Minute,
                'h' | 'H' => TimeframeUnit::Hour,
                'd' | 'D' => TimeframeUnit::Day,
                'w' | 'W' => TimeframeUnit::Week,
                'M' => TimeframeUnit::Month,
                _ => return Err(invalid("unknown unit")),
            };
            (&input[..input.len() - last.len_utf8()], unit)
        };

        let amount: u32 = digits.parse().map_err(|_| invalid("amount is not a number"))?;
        let amount = NonZeroU32::new(amount).ok_or_else(|| TimeframeError::InvalidAmount {
            unit,
            message: "amount must be > 0".into(),
        })?;
        Ok(Timeframe::new(amount, unit))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = TimeframeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}
