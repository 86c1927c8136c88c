//! Arrow schema of a partition file and conversion to/from [`Bar`].

use std::sync::{Arc, LazyLock};

use arrow::{
    array::{Array, ArrayRef, Float64Array, StringArray, TimestampMillisecondArray, UInt64Array},
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    error::ArrowError,
    record_batch::RecordBatch,
};
use chrono::DateTime;
use market_data_ingestor::models::bar::Bar;

use crate::layout::{MONTH_COLUMN, SYMBOL_KEY_COLUMN, TIMEFRAME_COLUMN, YEAR_COLUMN};

/// Exact symbol of the series, repeated on every row.
pub const SYMBOL: &str = "symbol";
pub const TIMESTAMP: &str = "timestamp";
pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const CLOSE: &str = "close";
pub const VOLUME: &str = "volume";
pub const TRADE_COUNT: &str = "trade_count";
pub const VWAP: &str = "vwap";

/// Columns stored inside each file, in order.
pub const FILE_COLUMNS: [&str; 9] = [
    SYMBOL,
    TIMESTAMP,
    OPEN,
    HIGH,
    LOW,
    CLOSE,
    VOLUME,
    TRADE_COUNT,
    VWAP,
];

static BAR_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new(SYMBOL, DataType::Utf8, false),
        Field::new(
            TIMESTAMP,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new(OPEN, DataType::Float64, false),
        Field::new(HIGH, DataType::Float64, false),
        Field::new(LOW, DataType::Float64, false),
        Field::new(CLOSE, DataType::Float64, false),
        Field::new(VOLUME, DataType::Float64, false),
        Field::new(TRADE_COUNT, DataType::UInt64, true),
        Field::new(VWAP, DataType::Float64, true),
    ]))
});

/// Schema of the data stored inside each partition file.
pub fn bar_schema() -> SchemaRef {
    Arc::clone(&BAR_SCHEMA)
}

/// Columns encoded in the directory names, appended after the file columns
/// when the lake is read as a table.
pub fn partition_columns() -> Vec<(String, DataType)> {
    [SYMBOL_KEY_COLUMN, TIMEFRAME_COLUMN, YEAR_COLUMN, MONTH_COLUMN]
        .into_iter()
        .map(|name| (name.to_string(), DataType::Utf8))
        .collect()
}

/// Encode the bars of `symbol` in file column order.
pub fn bars_to_record_batch(symbol: &str, bars: &[Bar]) -> Result<RecordBatch, ArrowError> {
    let f64_column = |get: fn(&Bar) -> f64| -> ArrayRef {
        Arc::new(bars.iter().map(get).collect::<Float64Array>())
    };
    let timestamps = TimestampMillisecondArray::from_iter_values(
        bars.iter().map(|b| b.timestamp.timestamp_millis()),
    )
    .with_timezone("UTC");

    RecordBatch::try_new(
        bar_schema(),
        vec![
            Arc::new(StringArray::from_iter_values(
                std::iter::repeat_n(symbol, bars.len()),
            )),
            Arc::new(timestamps),
            f64_column(|b| b.open),
            f64_column(|b| b.high),
            f64_column(|b| b.low),
            f64_column(|b| b.close),
            f64_column(|b| b.volume),
            Arc::new(bars.iter().map(|b| b.trade_count).collect::<UInt64Array>()),
            Arc::new(bars.iter().map(|b| b.vwap).collect::<Float64Array>()),
        ],
    )
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, String> {
    batch
        .column_by_name(name)
        .ok_or_else(|| format!("missing column `{name}`"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column `{name}` has unexpected type"))
}

fn required_f64(array: &Float64Array, name: &str, row: usize) -> Result<f64, String> {
    if array.is_null(row) {
        return Err(format!("null `{name}` at row {row}"));
    }
    Ok(array.value(row))
}

/// The single symbol stored in `batch`, `None` for an empty batch.
///
/// A batch mixing symbols is an error.
pub fn batch_symbol(batch: &RecordBatch) -> Result<Option<String>, String> {
    let symbols = column::<StringArray>(batch, SYMBOL)?;
    let mut found: Option<&str> = None;
    for row in 0..symbols.len() {
        if symbols.is_null(row) {
            return Err(format!("null `{SYMBOL}` at row {row}"));
        }
        let value = symbols.value(row);
        match found {
            None => found = Some(value),
            Some(first) if first != value => {
                return Err(format!("`{SYMBOL}` holds both {first:?} and {value:?}"));
            }
            Some(_) => {}
        }
    }
    Ok(found.map(str::to_string))
}

/// Decode bars from a batch carrying at least the file columns.
///
/// Columns are looked up by name, so extra columns (partition values) are
/// ignored. Errors describe the first offending column or row.
pub fn bars_from_record_batch(batch: &RecordBatch) -> Result<Vec<Bar>, String> {
    let timestamps = column::<TimestampMillisecondArray>(batch, TIMESTAMP)?;
    let open = column::<Float64Array>(batch, OPEN)?;
    let high = column::<Float64Array>(batch, HIGH)?;
    let low = column::<Float64Array>(batch, LOW)?;
    let close = column::<Float64Array>(batch, CLOSE)?;
    let volume = column::<Float64Array>(batch, VOLUME)?;
    let trade_count = column::<UInt64Array>(batch, TRADE_COUNT)?;
    let vwap = column::<Float64Array>(batch, VWAP)?;

    (0..batch.num_rows())
        .map(|row| {
            if timestamps.is_null(row) {
                return Err(format!("null `{TIMESTAMP}` at row {row}"));
            }
            let millis = timestamps.value(row);
            let timestamp = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| format!("timestamp {millis}ms out of range at row {row}"))?;
            Ok(Bar {
                timestamp,
                open: required_f64(open, OPEN, row)?,
                high: required_f64(high, HIGH, row)?,
                low: required_f64(low, LOW, row)?,
                close: required_f64(close, CLOSE, row)?,
                volume: required_f64(volume, VOLUME, row)?,
                trade_count: trade_count.is_valid(row).then(|| trade_count.value(row)),
                vwap: vwap.is_valid(row).then(|| vwap.value(row)),
            })
        })
        .collect()
}
