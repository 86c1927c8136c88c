use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    models::{asset::AssetClass, timeframe::Timeframe},
    providers::alpaca_rest::params::AlpacaBarsParams,
};

/// Universal parameters for one page-window of bar data from any provider.
///
/// Providers return bars with `since <= timestamp < until`, ascending, at most
/// `limit` of them. How many upstream pages that takes is the provider's concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BarsRequestParams {
    /// Symbol to request (e.g., `"AAPL"`, `"BTCUSDT"`, `"BTC/USD"`).
    pub symbol: String,

    /// The time interval for each bar.
    ///
    /// **Validation of allowed values is performed by each data provider
    /// implementation, according to their own API rules.**
    pub timeframe: Timeframe,

    /// Inclusive lower bound (UTC).
    pub since: DateTime<Utc>,

    /// Exclusive upper bound (UTC). `None` reads up to the latest bar.
    pub until: Option<DateTime<Utc>>,

    /// Maximum number of bars to return.
    pub limit: NonZeroU32,

    /// Lets providers route the request to the correct API or endpoint.
    #[serde(default)]
    pub asset_class: AssetClass,

    /// Optional, provider-specific parameters.
    #[serde(default)]
    pub provider_specific: ProviderParams,
}

/// An enum to hold provider-specific request parameters.
///
/// This allows callers to specify detailed, per-request options for a
/// particular provider without cluttering the universal `BarsRequestParams`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderParams {
    #[default]
    None,
    Alpaca(AlpacaBarsParams),
}
