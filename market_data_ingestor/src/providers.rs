//! Provider abstraction for market data sources.
//!
//! This module defines the [`DataProvider`] trait, which serves as a unified interface
//! for fetching time-series bar data from any market data vendor (e.g., Alpaca, Binance).
//!
//! Each concrete provider implementation handles its own pagination scheme
//! (Alpaca page tokens, Binance start-time cursors) and normalizes the result to one
//! ascending [`BarSeries`] of at most `limit` bars.
//!
//! Failures are reported as [`ProviderError`], and every variant knows its
//! [`Retryability`]: the governor retries transient ones and gives up on the rest.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use market_data_ingestor::models::{
//!     bar_series::BarSeries,
//!     request_params::BarsRequestParams,
//! };
//! use market_data_ingestor::providers::{DataProvider, ProviderError};
//!
//! struct MyProvider;
//!
//! #[async_trait]
//! impl DataProvider for MyProvider {
//!     fn name(&self) -> &'static str {
//!         "mine"
//!     }
//!
//!     async fn fetch_bars(
//!         &self,
//!         params: &BarsRequestParams,
//!     ) -> Result<BarSeries, ProviderError> {
//!         Ok(BarSeries::empty(params.symbol.clone(), params.timeframe))
//!     }
//! }
//! ```

pub mod alpaca_rest;
pub mod binance;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, header::RETRY_AFTER};
use shared_utils::env::MissingEnvVarError;
use snafu::{Backtrace, Snafu};

use crate::models::{bar_series::BarSeries, request_params::BarsRequestParams};

/// Trait for fetching time-series bar data from a market data provider.
///
/// Implementations must be shareable across concurrently running jobs, so the
/// trait requires `Send + Sync` and is used as `Arc<dyn DataProvider>`.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Short stable name used in logs.
    fn name(&self) -> &'static str;

    /// Fetches bars for one symbol starting at `params.since`.
    ///
    /// # Returns
    ///
    /// * `Ok(BarSeries)` - ascending bars, at most `params.limit`, all before `params.until`.
    ///   An empty series means there is nothing more in the window.
    /// * `Err(ProviderError)` - classified as transient or permanent.
    async fn fetch_bars(&self, params: &BarsRequestParams) -> Result<BarSeries, ProviderError>;
}

/// Whether an upstream failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Rate limits, timeouts, connection resets, upstream 5xx.
    Transient,
    /// Bad symbol, bad credentials, malformed payloads.
    Permanent,
}

/// Errors that can occur during the creation of a provider instance
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderInitError {
    /// missed environment variable.
    #[snafu(display("Missing environment variable: {source}"))]
    MissingEnvVar {
        source: MissingEnvVarError,
        backtrace: Backtrace,
    },

    /// failed to init reqwest client
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// API key contains invalid characters.
    #[snafu(display("Invalid API key format: {source}"))]
    InvalidApiKey {
        source: reqwest::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
}

/// Errors that can occur within a `DataProvider` implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    /// Transport-level failure (connect, reset, body read, client-side timeout).
    #[snafu(display("API request failed: {source}"))]
    Reqwest {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// The provider's API answered with a non-success status.
    #[snafu(display("API error (HTTP {status}): {message}"))]
    Api {
        status: u16,
        message: String,
        backtrace: Backtrace,
    },

    /// The provider asked us to slow down.
    #[snafu(display("rate limited by upstream (HTTP {status}), retry after {retry_after:?}"))]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
        backtrace: Backtrace,
    },

    /// The call did not finish within the configured per-call timeout.
    #[snafu(display("upstream call timed out after {elapsed:?}"))]
    Timeout {
        elapsed: Duration,
        backtrace: Backtrace,
    },

    /// The response body is not the JSON shape the provider documents.
    #[snafu(display("failed to decode response: {source}"))]
    Decode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    /// The response decoded but carries values we cannot interpret.
    #[snafu(display("malformed response: {message}"))]
    MalformedResponse {
        message: String,
        backtrace: Backtrace,
    },

    /// The request parameters were invalid for this specific provider.
    #[snafu(display("Invalid parameters for provider: {message}"))]
    Validation {
        message: String,
        backtrace: Backtrace,
    },

    /// An internal error occurred while processing data within the provider.
    #[snafu(display("Internal provider error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },

    /// An error during provider configuration or initialization.
    #[snafu(context(false), display("Provider initialization error: {source}"))]
    Init {
        #[snafu(backtrace)]
        source: ProviderInitError,
    },
}

impl ProviderError {
    /// Classify this failure for the retry loop.
    pub fn retryability(&self) -> Retryability {
        match self {
            ProviderError::Reqwest { source, .. } => classify_reqwest(source),
            ProviderError::Api { status, .. } => classify_status(*status),
            ProviderError::RateLimited { .. } | ProviderError::Timeout { .. } => {
                Retryability::Transient
            }
            ProviderError::Decode { .. }
            | ProviderError::MalformedResponse { .. }
            | ProviderError::Validation { .. }
            | ProviderError::Internal { .. }
            | ProviderError::Init { .. } => Retryability::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.retryability() == Retryability::Transient
    }

    /// Server-provided hint for how long to wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// HTTP status classes that are worth another attempt.
pub fn classify_status(status: u16) -> Retryability {
    match status {
        408 | 425 | 429 | 500..=599 => Retryability::Transient,
        _ => Retryability::Permanent,
    }
}

fn classify_reqwest(err: &reqwest::Error) -> Retryability {
    if let Some(status) = err.status() {
        return classify_status(status.as_u16());
    }
    if err.is_decode() || err.is_builder() || err.is_redirect() {
        return Retryability::Permanent;
    }
    // timeouts, connect failures, resets mid-body
    Retryability::Transient
}

/// Turn a non-success response into a [`ProviderError`].
///
/// 429 (and any status in `rate_limit_statuses`) becomes `RateLimited` with the
/// `Retry-After` seconds if present; everything else is `Api` with the body text.
pub(crate) async fn error_from_response(
    response: Response,
    rate_limit_statuses: &[StatusCode],
) -> ProviderError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || rate_limit_statuses.contains(&status) {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return RateLimitedSnafu {
            status: status.as_u16(),
            retry_after,
        }
        .build();
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown API error".to_string());
    ApiSnafu {
        status: status.as_u16(),
        message,
    }
    .build()
}
