use async_trait::async_trait;
use reqwest::{Client, header};
use secrecy::{ExposeSecret, SecretString};
use shared_utils::env::get_env_var;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    models::{bar::Bar, bar_series::BarSeries, request_params::BarsRequestParams},
    providers::{
        ClientBuildSnafu, DataProvider, DecodeSnafu, InvalidApiKeySnafu, MalformedResponseSnafu,
        MissingEnvVarSnafu, ProviderError, ProviderInitError, ReqwestSnafu,
        alpaca_rest::{
            params::{bars_path, construct_params, validate_timeframe},
            response::AlpacaResponse,
        },
        error_from_response,
    },
};

pub const DEFAULT_BASE_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaProvider {
    client: Client,
    base_url: String,
}

impl AlpacaProvider {
    /// Creates a new Alpaca provider.
    ///
    /// Reads API keys from the `APCA_API_KEY_ID` and `APCA_API_SECRET_KEY`
    /// environment variables.
    pub fn new() -> Result<Self, ProviderInitError> {
        Self::from_env(DEFAULT_BASE_URL)
    }

    /// Same as [`AlpacaProvider::new`] against a different host.
    pub fn from_env(base_url: impl Into<String>) -> Result<Self, ProviderInitError> {
        let api_key = SecretString::new(
            get_env_var("APCA_API_KEY_ID")
                .context(MissingEnvVarSnafu)?
                .into(),
        );
        let secret_key = SecretString::new(
            get_env_var("APCA_API_SECRET_KEY")
                .context(MissingEnvVarSnafu)?
                .into(),
        );
        Self::with_credentials(api_key, secret_key, base_url)
    }

    pub fn with_credentials(
        api_key: SecretString,
        secret_key: SecretString,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderInitError> {
        let mut headers = header::HeaderMap::new();
        let mut key_header =
            header::HeaderValue::from_str(api_key.expose_secret()).context(InvalidApiKeySnafu)?;
        key_header.set_sensitive(true);
        let mut secret_header = header::HeaderValue::from_str(secret_key.expose_secret())
            .context(InvalidApiKeySnafu)?;
        secret_header.set_sensitive(true);
        headers.insert("APCA-API-KEY-ID", key_header);
        headers.insert("APCA-API-SECRET-KEY", secret_header);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context(ClientBuildSnafu)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DataProvider for AlpacaProvider {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    async fn fetch_bars(&self, params: &BarsRequestParams) -> Result<BarSeries, ProviderError> {
        let timeframe = validate_timeframe(&params.timeframe)?;
        let url = format!("{}{}", self.base_url, bars_path(params.asset_class)?);
        let limit = params.limit.get() as usize;

        let mut bars: Vec<Bar> = Vec::new();
        let mut next_page_token: Option<String> = None;

        loop {
            let remaining = (limit - bars.len()) as u32;
            let query = construct_params(params, &timeframe, remaining, next_page_token.as_deref());

            let response = self
                .client
                .get(&url)
                .query(&query)
                .send()
                .await
                .context(ReqwestSnafu)?;

            if !response.status().is_success() {
                return Err(error_from_response(response, &[]).await);
            }

            let body = response.text().await.context(ReqwestSnafu)?;
            let page: AlpacaResponse = serde_json::from_str(&body).context(DecodeSnafu)?;

            let mut page_bars = page.bars.unwrap_or_default();
            if let Some(other) = page_bars.keys().find(|k| k.as_str() != params.symbol) {
                return MalformedResponseSnafu {
                    message: format!("requested {} but response carries {other}", params.symbol),
                }
                .fail();
            }
            let fetched = page_bars
                .shift_remove(&params.symbol)
                .unwrap_or_default();
            debug!(
                provider = "alpaca",
                symbol = %params.symbol,
                bars = fetched.len(),
                "fetched page"
            );
            bars.extend(fetched.into_iter().map(Bar::from));

            match page.next_page_token {
                Some(token) if bars.len() < limit => next_page_token = Some(token),
                _ => break,
            }
        }

        if let Some(until) = params.until {
            bars.retain(|b| b.timestamp < until);
        }
        bars.truncate(limit);

        Ok(BarSeries::new(params.symbol.clone(), params.timeframe, bars))
    }
}
