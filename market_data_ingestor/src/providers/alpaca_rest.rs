//! Alpaca market data REST API (`/v2/stocks/bars`, `/v1beta3/crypto/us/bars`).

pub mod params;
pub mod provider;
pub mod response;

pub use params::AlpacaBarsParams;
pub use provider::AlpacaProvider;
