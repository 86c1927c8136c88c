//! Provider registry that helps the runtime map a [`ProviderId`] to a concrete
//! provider behind its rate governor.

use std::sync::Arc;

use market_data_ingestor::{
    providers::{
        DataProvider, ProviderInitError,
        alpaca_rest::{AlpacaProvider, provider::DEFAULT_BASE_URL as ALPACA_BASE_URL},
        binance::BinanceProvider,
    },
    rate_limit::{RateGovernor, RequestBudget, RetryPolicy},
};

use crate::{config::ProviderSettings, spec::ProviderId};

/// Build the data provider for `id`, honouring a base URL override.
///
/// Alpaca reads its credentials from `APCA_API_KEY_ID` / `APCA_API_SECRET_KEY`.
pub fn build_provider(
    id: ProviderId,
    settings: &ProviderSettings,
) -> Result<Arc<dyn DataProvider>, ProviderInitError> {
    match id {
        ProviderId::Alpaca => {
            let base_url = settings.base_url.as_deref().unwrap_or(ALPACA_BASE_URL);
            Ok(Arc::new(AlpacaProvider::from_env(base_url)?))
        }
        ProviderId::Binance => {
            let provider = match settings.base_url.as_deref() {
                Some(url) => BinanceProvider::with_base_url(url)?,
                None => BinanceProvider::new()?,
            };
            Ok(Arc::new(provider))
        }
    }
}

/// Provider wrapped in the governor configured for it.
pub fn build_governor(
    id: ProviderId,
    settings: &ProviderSettings,
) -> Result<Arc<RateGovernor>, ProviderInitError> {
    let provider = build_provider(id, settings)?;
    Ok(Arc::new(RateGovernor::new(
        provider,
        RequestBudget::from(&settings.budget),
        RetryPolicy::from(&settings.retry),
    )))
}
