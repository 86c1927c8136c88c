//! Binance spot klines (`GET /api/v3/klines`), public and unauthenticated.
//!
//! Pagination is a `startTime` cursor: each page returns up to 1000 klines
//! starting at the cursor, and the next cursor is the last open time + 1 ms.

pub mod provider;
pub mod response;

pub use provider::BinanceProvider;
