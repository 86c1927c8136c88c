//! Per-provider request budget and bounded retry.
//!
//! One [`RateGovernor`] wraps one provider and is shared (`Arc`) by every job
//! that talks to it. Each attempt first waits for a token from a GCRA limiter
//! (equivalent to a token bucket with burst `capacity` refilling
//! `refill_per_second`), then runs the call under a per-call timeout. Transient
//! failures back off exponentially with jitter; permanent ones return at once.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rand::Rng;
use tracing::{debug, warn};

use crate::{
    errors::IngestionError,
    models::{bar_series::BarSeries, request_params::BarsRequestParams},
    providers::{DataProvider, ProviderError, TimeoutSnafu},
};

/// Token bucket parameters plus the per-call deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBudget {
    /// Burst size `C`.
    pub capacity: NonZeroU32,
    /// Steady-state refill `R` tokens per second.
    pub refill_per_second: NonZeroU32,
    /// Deadline for a single upstream call; overrunning it is a transient error.
    pub call_timeout: Duration,
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self {
            capacity: nonzero!(10u32),
            refill_per_second: nonzero!(5u32),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RequestBudget {
    pub fn quota(&self) -> Quota {
        Quota::per_second(self.refill_per_second).allow_burst(self.capacity)
    }
}

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (`N`).
    pub max_attempts: NonZeroU32,
    /// Delay before the first retry (`d0`).
    pub base_delay: Duration,
    /// Growth factor per retry (`m`).
    pub multiplier: f64,
    /// Upper bound on any single delay (`dmax`).
    pub max_delay: Duration,
    /// Fractional jitter `j`; a delay `d` becomes uniform in `[d(1-j), d(1+j)]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: nonzero!(5u32),
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let secs = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Jittered delay before retry number `retry`, never above `max_delay`.
    pub fn delay_for<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(retry);
        let j = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if j == 0.0 {
            return nominal;
        }
        let factor = rng.random_range((1.0 - j)..=(1.0 + j));
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
            .unwrap_or(nominal)
            .min(self.max_delay)
    }
}

/// Throttled, retrying front for one provider.
pub struct RateGovernor {
    provider: Arc<dyn DataProvider>,
    limiter: DefaultDirectRateLimiter,
    budget: RequestBudget,
    retry: RetryPolicy,
}

impl RateGovernor {
    pub fn new(provider: Arc<dyn DataProvider>, budget: RequestBudget, retry: RetryPolicy) -> Self {
        Self {
            provider,
            limiter: RateLimiter::direct(budget.quota()),
            budget,
            retry,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Suspend until a request token is available. Never skips.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    async fn attempt(&self, params: &BarsRequestParams) -> Result<BarSeries, ProviderError> {
        self.acquire().await;
        match tokio::time::timeout(self.budget.call_timeout, self.provider.fetch_bars(params)).await
        {
            Ok(result) => result,
            Err(_) => TimeoutSnafu {
                elapsed: self.budget.call_timeout,
            }
            .fail(),
        }
    }

    /// Fetch one window through the limiter with bounded retry.
    ///
    /// Transient errors are retried up to `max_attempts` total calls, then
    /// surface as [`IngestionError::RetryExhausted`]. Permanent errors surface
    /// immediately as [`IngestionError::Upstream`].
    pub async fn fetch_bars(&self, params: &BarsRequestParams) -> Result<BarSeries, IngestionError> {
        let max_attempts = self.retry.max_attempts.get();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(params).await {
                Ok(series) => {
                    if attempt > 1 {
                        debug!(
                            provider = self.provider_name(),
                            symbol = %params.symbol,
                            attempt,
                            "recovered after retry"
                        );
                    }
                    return Ok(series);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!(
                    provider = self.provider_name(),
                    symbol = %params.symbol,
                    error = %err,
                    "permanent upstream error"
                );
                return Err(IngestionError::Upstream(err));
            }
            if attempt >= max_attempts {
                warn!(
                    provider = self.provider_name(),
                    symbol = %params.symbol,
                    attempts = attempt,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(IngestionError::RetryExhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let backoff = self.retry.delay_for(attempt, &mut rand::rng());
            let delay = err.retry_after().map_or(backoff, |hint| hint.max(backoff));
            warn!(
                provider = self.provider_name(),
                symbol = %params.symbol,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient upstream error, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;
    use rand::{SeedableRng, rngs::StdRng};

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: nonzero!(5u32),
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1_000),
            jitter,
        }
    }

    #[test]
    fn backoff_grows_then_caps() {
        let p = policy(0.0);
        let delays: Vec<u128> = (1..=6).map(|k| p.nominal_delay(k).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn jitter_stays_in_band_and_under_cap() {
        let p = policy(0.25);
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..=6 {
            let nominal = p.nominal_delay(retry).as_secs_f64();
            for _ in 0..200 {
                let d = p.delay_for(retry, &mut rng);
                assert!(d.as_secs_f64() >= nominal * 0.75 - 1e-9);
                assert!(d.as_secs_f64() <= nominal * 1.25 + 1e-9);
                assert!(d <= p.max_delay);
            }
        }
    }

    #[test]
    fn burst_then_refill() {
        let budget = RequestBudget {
            capacity: nonzero!(5u32),
            refill_per_second: nonzero!(2u32),
            call_timeout: Duration::from_secs(1),
        };
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::direct_with_clock(budget.quota(), clock.clone());

        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());

        clock.advance(Duration::from_millis(500));
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn never_exceeds_burst_plus_refill_in_any_second() {
        let capacity = 4u32;
        let refill = 3u32;
        let budget = RequestBudget {
            capacity: NonZeroU32::new(capacity).unwrap(),
            refill_per_second: NonZeroU32::new(refill).unwrap(),
            call_timeout: Duration::from_secs(1),
        };
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::direct_with_clock(budget.quota(), clock.clone());

        // hammer the limiter every 10ms for 10s, recording admitted instants
        let step_ms = 10u64;
        let mut admitted: Vec<u64> = Vec::new();
        for tick in 0..1_000u64 {
            for _ in 0..3 {
                if limiter.check().is_ok() {
                    admitted.push(tick * step_ms);
                }
            }
            clock.advance(Duration::from_millis(step_ms));
        }

        assert!(!admitted.is_empty());
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..].iter().take_while(|&&t| t < start + 1_000).count();
            assert!(
                in_window as u32 <= capacity + refill,
                "{in_window} requests in the second starting at {start}ms"
            );
        }
    }
}
