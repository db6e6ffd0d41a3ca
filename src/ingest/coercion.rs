//! Text → typed value coercion.
//!
//! Every raw field read by a parser goes through [`coerce`] exactly once. The
//! function is total: it returns a [`Value`] or a [`CoercionError`], never
//! panics, and treats blank input as `Null` for every column type. Whether a
//! null is acceptable is decided by the row builder, not here.

use crate::schema::ColumnType;
use crate::value::{EXPORT_DATETIME_FORMAT, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Date layouts tried in order; the first one that parses wins.
const DATE_PATTERNS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d", "%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y",
];

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert '{raw}' to {}: {reason}", .column_type.as_str())]
pub struct CoercionError {
    pub raw: String,
    pub column_type: ColumnType,
    pub reason: String,
}

impl CoercionError {
    fn new(raw: &str, column_type: ColumnType, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            column_type,
            reason: reason.into(),
        }
    }
}

/// Convert one raw field into a value of the declared column type.
pub fn coerce(raw: &str, column_type: ColumnType) -> Result<Value, CoercionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }

    match column_type {
        ColumnType::Text => Ok(Value::Text(trimmed.to_string())),
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| CoercionError::new(raw, column_type, e.to_string())),
        ColumnType::Double => parse_double(trimmed)
            .map(Value::Float)
            .ok_or_else(|| CoercionError::new(raw, column_type, "not a finite number")),
        ColumnType::Boolean => parse_bool(trimmed)
            .map(Value::Bool)
            .ok_or_else(|| CoercionError::new(raw, column_type, "not a recognised boolean")),
        ColumnType::Date => parse_date(trimmed)
            .map(Value::Date)
            .ok_or_else(|| CoercionError::new(raw, column_type, "no date pattern matched")),
    }
}

fn parse_double(input: &str) -> Option<f64> {
    let normalized = input.replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "t" | "да" => Some(true),
        "false" | "no" | "n" | "0" | "f" | "нет" => Some(false),
        _ => None,
    }
}

/// Parse a calendar date using the ordered patterns, compact forms and
/// finally full date-time text (time part discarded).
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    for pattern in DATE_PATTERNS {
        if let Ok(date) = NaiveDate::parse_from_str(input, pattern) {
            return Some(date);
        }
    }

    if let Some(date) = parse_compact(input) {
        return Some(date);
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(input, EXPORT_DATETIME_FORMAT) {
        return Some(dt.date());
    }

    DateTime::parse_from_rfc3339(input)
        .ok()
        .map(|dt| dt.naive_utc().date())
}

/// Eight digits read as `YYYYMMDD`, falling back to `YYYYDDMM`.
fn parse_compact(input: &str) -> Option<NaiveDate> {
    if input.len() != 8 || !input.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let year: i32 = input[0..4].parse().ok()?;
    let first: u32 = input[4..6].parse().ok()?;
    let second: u32 = input[6..8].parse().ok()?;

    NaiveDate::from_ymd_opt(year, first, second)
        .or_else(|| NaiveDate::from_ymd_opt(year, second, first))
}
