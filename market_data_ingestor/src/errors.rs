use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::providers::ProviderError;

/// Orchestration-level failure of one fetch step.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Every attempt hit a transient upstream error.
    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    /// A permanent upstream error; never retried.
    #[error("permanent upstream error: {0}")]
    Upstream(#[source] ProviderError),

    /// A fetched batch failed validation.
    #[error("invalid data: {reason}")]
    InvalidData {
        reason: String,
        /// Timestamp of the first offending bar, when there is one.
        at: Option<DateTime<Utc>>,
    },
}

impl IngestionError {
    pub fn invalid(reason: impl Into<String>, at: Option<DateTime<Utc>>) -> Self {
        IngestionError::InvalidData {
            reason: reason.into(),
            at,
        }
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, IngestionError::RetryExhausted { .. })
    }
}
