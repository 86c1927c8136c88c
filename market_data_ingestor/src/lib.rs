//! Market data acquisition: the bar model, timeframe bucket math, upstream
//! provider adapters, and the per-provider rate/retry governor.

pub mod bucket;
pub mod errors;
pub mod models;
pub mod providers;
pub mod rate_limit;
