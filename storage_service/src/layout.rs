//! On-disk partition layout.
//!
//! ```text
//! <root>/symbol_key=<K>/timeframe=<TF>/year=<YYYY>/month=<MM>/data.parquet
//! ```
//!
//! Every bar maps to exactly one partition. `K` is the symbol passed through
//! [`encode_symbol`]: ASCII letters, digits, `.` and `-` are kept and every
//! other byte becomes `_XX` (uppercase hex), so `BTC/USD` is `BTC_2FUSD` and
//! distinct symbols never share a directory. The exact symbol is also stored
//! inside each file as the `symbol` column.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use market_data_ingestor::models::timeframe::Timeframe;

pub const DATA_FILE_NAME: &str = "data.parquet";
/// Advisory lock file next to each data file. Never read by the catalog.
pub const LOCK_FILE_NAME: &str = ".lock";

pub const SYMBOL_KEY_COLUMN: &str = "symbol_key";
pub const TIMEFRAME_COLUMN: &str = "timeframe";
pub const YEAR_COLUMN: &str = "year";
pub const MONTH_COLUMN: &str = "month";

const ESCAPE: u8 = b'_';

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-'
}

/// Directory value for a symbol. Injective, and the output only uses
/// characters that are safe in a path segment and in an object store key.
pub fn encode_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for &byte in symbol.as_bytes() {
        if is_plain(byte) {
            out.push(char::from(byte));
        } else {
            out.push(char::from(ESCAPE));
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_symbol`]. `None` when `encoded` is not a value
/// [`encode_symbol`] could have produced.
pub fn decode_symbol(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            ESCAPE => {
                let hex = encoded.get(i + 1..i + 3)?;
                if hex.bytes().any(|b| b.is_ascii_lowercase()) {
                    return None;
                }
                let byte = u8::from_str_radix(hex, 16).ok()?;
                if is_plain(byte) {
                    return None;
                }
                out.push(byte);
                i += 3;
            }
            byte if is_plain(byte) => {
                out.push(byte);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

/// Identifies one partition file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// The symbol as requested, not encoded.
    pub symbol: String,
    pub timeframe: Timeframe,
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    /// Partition holding the bar of `symbol`/`timeframe` that starts at `ts`.
    pub fn for_bar(symbol: &str, timeframe: Timeframe, ts: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            year: ts.year(),
            month: ts.month(),
        }
    }

    /// `symbol_key=../timeframe=../year=../month=..` relative to the data root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("{SYMBOL_KEY_COLUMN}={}", encode_symbol(&self.symbol)))
            .join(format!("{TIMEFRAME_COLUMN}={}", self.timeframe))
            .join(format!("{YEAR_COLUMN}={:04}", self.year))
            .join(format!("{MONTH_COLUMN}={:02}", self.month))
    }

    pub fn file_path(&self, root: &Path) -> PathBuf {
        root.join(self.relative_dir()).join(DATA_FILE_NAME)
    }

    /// First instant of the calendar month this partition covers.
    pub fn month_start(&self) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Recover the key from a data file path relative to the root.
    ///
    /// Returns `None` for anything that is not a well-formed partition file.
    pub fn from_relative_path(path: &Path) -> Option<Self> {
        let parts: Vec<&str> = path.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
        let [symbol, timeframe, year, month, file] = parts.as_slice() else {
            return None;
        };
        if *file != DATA_FILE_NAME {
            return None;
        }
        let value = |part: &'static str, segment: &str| {
            segment
                .strip_prefix(part)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        };
        let symbol = value(SYMBOL_KEY_COLUMN, symbol)
            .and_then(|encoded| decode_symbol(&encoded))
            .filter(|s| !s.is_empty())?;
        let timeframe = value(TIMEFRAME_COLUMN, timeframe)?.parse().ok()?;
        let year = value(YEAR_COLUMN, year)?.parse().ok()?;
        let month = value(MONTH_COLUMN, month)?.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self {
            symbol,
            timeframe,
            year,
            month,
        })
    }
}

/// Every partition file under `root`, sorted by key.
///
/// Temporary files and directories that do not follow the layout are skipped.
/// A missing root yields an empty list.
pub fn scan_partitions(root: &Path) -> io::Result<Vec<(PartitionKey, PathBuf)>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    walk(root, root, 0, &mut found)?;
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

fn walk(
    root: &Path,
    dir: &Path,
    depth: usize,
    found: &mut Vec<(PartitionKey, PathBuf)>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() && depth < 4 {
            walk(root, &path, depth + 1, found)?;
        } else if file_type.is_file() && depth == 4 {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if let Some(key) = PartitionKey::from_relative_path(relative) {
                found.push((key, path));
            }
        }
    }
    Ok(())
}
