//! PostgreSQL binary `COPY` encoding.
//!
//! A batch is written as one complete binary copy stream: signature, flags
//! and extension length, one tuple per row, then the `-1` trailer. Each value
//! is first normalized to the layout's [`WireType`] so date columns can take
//! timestamps, Unix epoch seconds or spreadsheet serial days.

use crate::ingest::coercion::{coerce, parse_date};
use crate::schema::{ColumnType, Row, RowLayout, WireType};
use crate::store::StorageError;
use crate::value::{EXPORT_DATETIME_FORMAT, Value};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// `2000-01-01` in days from the common era.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;
/// `2000-01-01T00:00:00Z` as Unix seconds.
const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;
/// `1899-12-30`, day zero of spreadsheet serial dates, in days from the common era.
const SERIAL_EPOCH_DAYS_FROM_CE: i32 = 693_594;

impl WireType {
    pub fn name(&self) -> &'static str {
        match self {
            WireType::Text => "text",
            WireType::Int8 => "bigint",
            WireType::Float8 => "double precision",
            WireType::Bool => "boolean",
            WireType::Date => "date",
            WireType::TimestampTz => "timestamptz",
        }
    }
}

/// Bring a value into the shape the wire type stores; `None` if impossible.
pub fn normalize(value: &Value, wire_type: WireType) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }

    match wire_type {
        WireType::Text => value.export_text().map(Value::Text),
        WireType::Int8 => match value {
            Value::Int(v) => Some(Value::Int(*v)),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                Some(Value::Int(*v as i64))
            }
            Value::Text(s) => coerce(s, ColumnType::Integer).ok(),
            _ => None,
        },
        WireType::Float8 => match value {
            Value::Float(v) => Some(Value::Float(*v)),
            Value::Int(v) => Some(Value::Float(*v as f64)),
            Value::Text(s) => coerce(s, ColumnType::Double).ok(),
            _ => None,
        },
        WireType::Bool => match value {
            Value::Bool(v) => Some(Value::Bool(*v)),
            Value::Text(s) => coerce(s, ColumnType::Boolean).ok(),
            _ => None,
        },
        WireType::Date => date_of(value).map(Value::Date),
        WireType::TimestampTz => match value {
            Value::Timestamp(ts) => Some(Value::Timestamp(*ts)),
            Value::Date(d) => Some(Value::Timestamp(d.and_time(NaiveTime::MIN).and_utc())),
            Value::Text(s) => parse_timestamp(s).map(Value::Timestamp),
            _ => None,
        },
    }
}

fn date_of(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::Timestamp(ts) => Some(ts.date_naive()),
        Value::Int(secs) => DateTime::from_timestamp(*secs, 0).map(|dt| dt.date_naive()),
        Value::Float(serial) if serial.is_finite() && *serial >= 0.0 => {
            let base = NaiveDate::from_num_days_from_ce_opt(SERIAL_EPOCH_DAYS_FROM_CE)?;
            base.checked_add_days(Days::new(serial.floor() as u64))
        }
        Value::Text(s) => parse_date(s.trim()),
        _ => None,
    }
}

fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(input, EXPORT_DATETIME_FORMAT)
                .ok()
                .map(|dt| dt.and_utc())
        })
}

/// Encode a batch as one binary copy stream in layout column order.
pub fn encode_rows(layout: &RowLayout, rows: &[Row]) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::with_capacity(64 + rows.len() * layout.width() * 12);
    buf.extend_from_slice(SIGNATURE);
    buf.extend_from_slice(&0i32.to_be_bytes());
    buf.extend_from_slice(&0i32.to_be_bytes());

    let field_count = i16::try_from(layout.width())
        .map_err(|_| StorageError::Backend("too many columns for binary copy".to_string()))?;

    for row in rows {
        buf.extend_from_slice(&field_count.to_be_bytes());
        for (idx, wire_type) in layout.wire_types().iter().enumerate() {
            let raw = row.value(idx);
            let value = normalize(raw, *wire_type).ok_or_else(|| StorageError::Encode {
                column: layout.names()[idx].clone(),
                value: format!("{} {}", raw.kind(), raw),
                expected: wire_type.name(),
            })?;
            write_field(&mut buf, &value);
        }
    }

    buf.extend_from_slice(&(-1i16).to_be_bytes());
    Ok(buf)
}

fn write_field(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.extend_from_slice(&(-1i32).to_be_bytes()),
        Value::Int(v) => put(buf, &v.to_be_bytes()),
        Value::Float(v) => put(buf, &v.to_be_bytes()),
        Value::Bool(v) => put(buf, &[u8::from(*v)]),
        Value::Date(d) => {
            let days = d.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE;
            put(buf, &days.to_be_bytes())
        }
        Value::Timestamp(ts) => {
            let micros = ts.timestamp_micros() - PG_EPOCH_UNIX_SECS * 1_000_000;
            put(buf, &micros.to_be_bytes())
        }
        Value::Text(s) => put(buf, s.as_bytes()),
    }
}

fn put(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    buf.extend_from_slice(bytes);
}
