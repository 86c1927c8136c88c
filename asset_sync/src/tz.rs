//! Timestamp text helpers.
//!
//! All database values are RFC 3339 UTC strings with millisecond precision, so
//! they sort lexicographically in time order. Inputs with any explicit offset
//! are accepted and converted to UTC.

use anyhow::Context;
use chrono::{DateTime, Utc};

/// RFC-3339 with offset -> UTC.
///
/// Example:
/// - "2024-03-10T09:30:00-05:00" -> "2024-03-10T14:30:00Z"
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Canonical storage form, e.g. `2024-03-10T14:30:00.000Z`.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
