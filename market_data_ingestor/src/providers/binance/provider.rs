use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    models::{
        bar::Bar,
        bar_series::BarSeries,
        request_params::BarsRequestParams,
        timeframe::{Timeframe, TimeframeUnit},
    },
    providers::{
        ApiSnafu, ClientBuildSnafu, DataProvider, DecodeSnafu, ProviderError, ProviderInitError,
        ReqwestSnafu, ValidationSnafu,
        binance::response::{BinanceErrorBody, Kline},
        error_from_response,
    },
};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const KLINES_PATH: &str = "/api/v3/klines";
/// Largest page the klines endpoint serves.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Binance answers 418 once an IP keeps going after a 429.
const IP_BANNED: StatusCode = StatusCode::IM_A_TEAPOT;

pub struct BinanceProvider {
    client: Client,
    base_url: String,
}

impl BinanceProvider {
    pub fn new() -> Result<Self, ProviderInitError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ProviderInitError> {
        let client = Client::builder()
            .user_agent(concat!("market_data_ingestor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(ClientBuildSnafu)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(
        &self,
        params: &BarsRequestParams,
        interval: &str,
        start_ms: i64,
        end_ms: Option<i64>,
        page_limit: u32,
    ) -> Result<Vec<Kline>, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", params.symbol.clone()),
            ("interval", interval.to_string()),
            ("startTime", start_ms.to_string()),
            ("limit", page_limit.to_string()),
        ];
        if let Some(end_ms) = end_ms {
            query.push(("endTime", end_ms.to_string()));
        }

        let response = self
            .client
            .get(format!("{}{}", self.base_url, KLINES_PATH))
            .query(&query)
            .send()
            .await
            .context(ReqwestSnafu)?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            // {"code":-1121,"msg":"Invalid symbol."} and friends
            let body = response.text().await.context(ReqwestSnafu)?;
            let message = serde_json::from_str::<BinanceErrorBody>(&body)
                .map(|e| format!("{} ({})", e.msg, e.code))
                .unwrap_or(body);
            return ApiSnafu {
                status: status.as_u16(),
                message,
            }
            .fail();
        }
        if !status.is_success() {
            return Err(error_from_response(response, &[IP_BANNED]).await);
        }

        let body = response.text().await.context(ReqwestSnafu)?;
        serde_json::from_str(&body).context(DecodeSnafu)
    }
}

/// Binance interval code for a timeframe, if the exchange serves it.
pub fn interval_for(tf: &Timeframe) -> Option<String> {
    let n = tf.amount().get();
    let supported = match tf.unit() {
        TimeframeUnit::Minute => [1, 3, 5, 15, 30].contains(&n),
        TimeframeUnit::Hour => [1, 2, 4, 6, 8, 12].contains(&n),
        TimeframeUnit::Day => [1, 3].contains(&n),
        TimeframeUnit::Week | TimeframeUnit::Month => n == 1,
    };
    if !supported {
        return None;
    }
    let unit = match tf.unit() {
        TimeframeUnit::Minute => "m",
        TimeframeUnit::Hour => "h",
        TimeframeUnit::Day => "d",
        TimeframeUnit::Week => "w",
        TimeframeUnit::Month => "M",
    };
    Some(format!("{n}{unit}"))
}

#[async_trait]
impl DataProvider for BinanceProvider {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_bars(&self, params: &BarsRequestParams) -> Result<BarSeries, ProviderError> {
        let Some(interval) = interval_for(&params.timeframe) else {
            return ValidationSnafu {
                message: format!("binance does not serve timeframe {}", params.timeframe),
            }
            .fail();
        };

        let limit = params.limit.get() as usize;
        // endTime is inclusive upstream; `until` is exclusive
        let end_ms = params.until.map(|u| u.timestamp_millis() - 1);
        let mut cursor = params.since.timestamp_millis();
        let mut bars: Vec<Bar> = Vec::with_capacity(limit.min(MAX_PAGE_LIMIT as usize));

        while bars.len() < limit {
            if end_ms.is_some_and(|end| cursor > end) {
                break;
            }
            let page_limit = ((limit - bars.len()) as u32).min(MAX_PAGE_LIMIT);
            let page = self
                .fetch_page(params, &interval, cursor, end_ms, page_limit)
                .await?;
            let fetched = page.len();
            if fetched == 0 {
                break;
            }

            let mut last_open = i64::MIN;
            for kline in page {
                let open_ms = kline.open_time_ms();
                if open_ms < cursor || open_ms <= last_open {
                    warn!(
                        provider = "binance",
                        symbol = %params.symbol,
                        open_ms,
                        cursor,
                        "skipping out-of-order kline"
                    );
                    continue;
                }
                last_open = open_ms;
                bars.push(kline.into_bar()?);
            }
            debug!(
                provider = "binance",
                symbol = %params.symbol,
                fetched,
                total = bars.len(),
                "fetched page"
            );

            // a cursor that does not move would loop forever
            if last_open == i64::MIN || last_open < cursor {
                break;
            }
            cursor = last_open + 1;
            if fetched < page_limit as usize {
                break;
            }
        }

        if let Some(until) = params.until {
            bars.retain(|b| b.timestamp < until);
        }
        bars.truncate(limit);

        Ok(BarSeries::new(params.symbol.clone(), params.timeframe, bars))
    }
}
