//! bucket.rs — UTC bucket mapping utilities
//!
//! - One stable epoch: Unix (1970-01-01T00:00:00Z).
//! - Fixed-size frames (minute/hour/day): second-based math.
//! - Week: Monday 00:00:00Z–aligned using a week epoch of 1969-12-29.
//! - Month: linear (year, month) indexing relative to 1970-01.
//!
//! All functions assume the input timestamp is UTC. Ids that map past the
//! representable range saturate to [`DateTime::<Utc>::MAX_UTC`].

use std::ops::Range;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::models::timeframe::{Timeframe, TimeframeUnit};

/// Unix epoch start (1970-01-01T00:00:00Z).
pub const EPOCH_UNIX: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Number of seconds in a minute.
pub const SECS_PER_MINUTE: i64 = 60;
/// Number of seconds in an hour.
pub const SECS_PER_HOUR: i64 = 60 * SECS_PER_MINUTE;
/// Number of seconds in a day.
pub const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;
/// Number of seconds in a week.
pub const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;

/// shift so Monday 1969-12-29 00:00Z becomes index 0
const WEEK_MONDAY_ANCHOR_OFFSET_SECS: i64 = 3 * SECS_PER_DAY; // +3d

/// Compute the bucket id for a UTC timestamp.
pub fn bucket_id(ts_utc: DateTime<Utc>, tf: Timeframe) -> u64 {
    let amount = tf.amount().get();
    match tf.unit() {
        TimeframeUnit::Minute => id_fixed(ts_utc, SECS_PER_MINUTE * amount as i64),
        TimeframeUnit::Hour => id_fixed(ts_utc, SECS_PER_HOUR * amount as i64),
        TimeframeUnit::Day => id_fixed(ts_utc, SECS_PER_DAY * amount as i64),
        TimeframeUnit::Week => id_week(ts_utc, amount),
        TimeframeUnit::Month => id_month(ts_utc, amount),
    }
}

/// Get the UTC start instant for a bucket id.
pub fn bucket_start_utc(id: u64, tf: Timeframe) -> DateTime<Utc> {
    let amount = tf.amount().get();
    match tf.unit() {
        TimeframeUnit::Minute => start_fixed(id, SECS_PER_MINUTE * amount as i64),
        TimeframeUnit::Hour => start_fixed(id, SECS_PER_HOUR * amount as i64),
        TimeframeUnit::Day => start_fixed(id, SECS_PER_DAY * amount as i64),
        TimeframeUnit::Week => start_week(id, amount),
        TimeframeUnit::Month => start_month(id, amount),
    }
}

/// Exclusive end instant for the bucket, i.e. the start of the next one.
pub fn bucket_end_exclusive_utc(id: u64, tf: Timeframe) -> DateTime<Utc> {
    bucket_start_utc(id.saturating_add(1), tf)
}

/// True when `ts` sits exactly on a bucket boundary of `tf`.
pub fn is_aligned(ts: DateTime<Utc>, tf: Timeframe) -> bool {
    bucket_start_utc(bucket_id(ts, tf), tf) == ts
}

/// Start of the bucket after the one containing `ts`.
pub fn next_bucket_start(ts: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
    bucket_end_exclusive_utc(bucket_id(ts, tf), tf)
}

/// Bucket ids covering `[start, end)`. A partial trailing bucket is included.
pub fn bucket_range(start: DateTime<Utc>, end: DateTime<Utc>, tf: Timeframe) -> Range<u64> {
    if end <= start {
        return 0..0;
    }
    let start_id = bucket_id(start, tf);
    let end_id = bucket_id(end, tf);
    let end_exclusive = if bucket_start_utc(end_id, tf) < end {
        end_id + 1
    } else {
        end_id
    };
    start_id..end_exclusive
}

// ----- fixed-size internals (minute/hour/day) -----

fn id_fixed(ts_utc: DateTime<Utc>, bucket_secs: i64) -> u64 {
    let secs = ts_utc.timestamp();
    (secs.div_euclid(bucket_secs)) as u64
}

fn start_fixed(id: u64, bucket_secs: i64) -> DateTime<Utc> {
    // i128 so a huge id saturates instead of wrapping
    let offset_secs = (id as i128) * (bucket_secs as i128);
    i64::try_from(offset_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| EPOCH_UNIX.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ----- week internals (Monday-aligned) -----

fn id_week(ts_utc: DateTime<Utc>, amount: u32) -> u64 {
    let secs = ts_utc.timestamp();
    let width = SECS_PER_WEEK * amount as i64;
    ((secs + WEEK_MONDAY_ANCHOR_OFFSET_SECS).div_euclid(width)) as u64
}

fn start_week(id: u64, amount: u32) -> DateTime<Utc> {
    let width = (SECS_PER_WEEK as i128) * (amount as i128);
    let since_anchor = (id as i128) * width;
    // back to unix seconds: undo the +3d applied on the way in
    let unix_secs = since_anchor - (WEEK_MONDAY_ANCHOR_OFFSET_SECS as i128);
    i64::try_from(unix_secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ----- month internals (calendar-aware) -----

fn id_month(ts_utc: DateTime<Utc>, amount: u32) -> u64 {
    // Linear month index relative to 1970-01 (index 0).
    let y = ts_utc.year() as i64;
    let m = ts_utc.month() as i64; // 1..=12
    let idx = (y - 1970) * 12 + (m - 1);
    (idx.div_euclid(amount as i64)) as u64
}

fn start_month(id: u64, amount: u32) -> DateTime<Utc> {
    let start_idx = (id as i128) * (amount as i128);
    let y = 1970 + start_idx.div_euclid(12);
    let month = (start_idx.rem_euclid(12) + 1) as u32; // 1..=12
    i32::try_from(y)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month, 1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// -------------------- tests --------------------
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::num::NonZeroU32;

    fn tf(n: u32, unit: TimeframeUnit) -> Timeframe {
        Timeframe::new(NonZeroU32::new(n).unwrap(), unit)
    }

    #[test]
    fn minute_roundtrip() {
        let tf = Timeframe::ONE_MINUTE;
        let t = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let id = bucket_id(t, tf);
        assert_eq!(bucket_id(bucket_start_utc(id, tf), tf), id);
        assert_eq!(
            bucket_start_utc(id, tf),
            Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 0).unwrap()
        );
    }

    #[test]
    fn month_roundtrip_and_boundaries() {
        let tf = Timeframe::ONE_MONTH;
        let t = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap(); // leap day
        let id = bucket_id(t, tf);
        let start = bucket_start_utc(id, tf);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        // end exclusive = start of next month
        let end = bucket_end_exclusive_utc(id, tf);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn weeks_start_on_monday() {
        let tf = tf(1, TimeframeUnit::Week);
        // 2024-05-16 is a Thursday
        let t = Utc.with_ymd_and_hms(2024, 5, 16, 12, 0, 0).unwrap();
        let start = bucket_start_utc(bucket_id(t, tf), tf);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).unwrap());
    }

    #[test]
    fn alignment() {
        let five = tf(5, TimeframeUnit::Minute);
        assert!(is_aligned(Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap(), five));
        assert!(!is_aligned(Utc.with_ymd_and_hms(2024, 1, 1, 0, 11, 0).unwrap(), five));
        assert!(!is_aligned(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 30).unwrap(),
            Timeframe::ONE_MINUTE
        ));
        assert!(is_aligned(
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            Timeframe::ONE_MONTH
        ));
    }

    #[test]
    fn next_bucket_from_unaligned_timestamp() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 30).unwrap();
        assert_eq!(
            next_bucket_start(t, Timeframe::ONE_MINUTE),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 11, 0).unwrap()
        );
    }

    #[test]
    fn range_includes_partial_tail() {
        let tf = Timeframe::ONE_HOUR;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let r = bucket_range(start, start + Duration::minutes(150), tf);
        assert_eq!(r.end - r.start, 3);
        let r = bucket_range(start, start + Duration::hours(2), tf);
        assert_eq!(r.end - r.start, 2);
        assert!(bucket_range(start, start, tf).is_empty());
    }
}
