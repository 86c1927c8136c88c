use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::{
    models::{
        asset::AssetClass,
        request_params::{BarsRequestParams, ProviderParams},
        timeframe::{Timeframe, TimeframeUnit},
    },
    providers::{ProviderError, ValidationSnafu},
};

/// Largest `limit` the bars endpoint accepts per page.
pub const MAX_PAGE_LIMIT: u32 = 10_000;

/// Specifies the corporate action adjustment for stock data.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    #[default]
    Raw,
    Split,
    Dividend,
    All,
}

/// Specifies the source feed for stock data.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    #[default]
    Sip,
    Iex,
    Otc,
}

impl Adjustment {
    fn as_str(&self) -> &'static str {
        match self {
            Adjustment::Raw => "raw",
            Adjustment::Split => "split",
            Adjustment::Dividend => "dividend",
            Adjustment::All => "all",
        }
    }
}

impl Feed {
    fn as_str(&self) -> &'static str {
        match self {
            Feed::Sip => "sip",
            Feed::Iex => "iex",
            Feed::Otc => "otc",
        }
    }
}

/// Alpaca-specific parameters for a bars request.
///
/// Bars are always requested in ascending order; paging limits are derived
/// from the universal request's `limit`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AlpacaBarsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<Adjustment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<Feed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// Map a [`Timeframe`] onto Alpaca's `timeframe` query value, enforcing the
/// amounts the API accepts.
pub fn validate_timeframe(tf: &Timeframe) -> Result<String, ProviderError> {
    let amount = tf.amount().get();
    let (ok, unit) = match tf.unit() {
        TimeframeUnit::Minute => ((1..=59).contains(&amount), "Min"),
        TimeframeUnit::Hour => ((1..=23).contains(&amount), "Hour"),
        TimeframeUnit::Day => (amount == 1, "Day"),
        TimeframeUnit::Week => (amount == 1, "Week"),
        TimeframeUnit::Month => ([1, 2, 3, 6, 12].contains(&amount), "Month"),
    };
    if !ok {
        return ValidationSnafu {
            message: format!("alpaca does not support timeframe {tf}"),
        }
        .fail();
    }
    Ok(format!("{amount}{unit}"))
}

/// Path of the bars endpoint for an asset class.
pub fn bars_path(asset_class: AssetClass) -> Result<&'static str, ProviderError> {
    match asset_class {
        AssetClass::UsEquity => Ok("/v2/stocks/bars"),
        AssetClass::Crypto => Ok("/v1beta3/crypto/us/bars"),
        AssetClass::Futures => ValidationSnafu {
            message: "alpaca does not serve futures bars",
        }
        .fail(),
    }
}

/// Build the query string for one page.
pub fn construct_params(
    params: &BarsRequestParams,
    timeframe: &str,
    page_limit: u32,
    page_token: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("symbols", params.symbol.clone()),
        ("timeframe", timeframe.to_string()),
        (
            "start",
            params.since.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("limit", page_limit.min(MAX_PAGE_LIMIT).to_string()),
        ("sort", "asc".to_string()),
    ];
    if let Some(until) = params.until {
        query.push(("end", until.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    if let (AssetClass::UsEquity, ProviderParams::Alpaca(extra)) =
        (params.asset_class, &params.provider_specific)
    {
        if let Some(adjustment) = &extra.adjustment {
            query.push(("adjustment", adjustment.as_str().to_string()));
        }
        if let Some(feed) = &extra.feed {
            query.push(("feed", feed.as_str().to_string()));
        }
        if let Some(currency) = &extra.currency {
            query.push(("currency", currency.clone()));
        }
    }
    if let Some(token) = page_token {
        query.push(("page_token", token.to_string()));
    }
    query
}
