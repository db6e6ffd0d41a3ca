//! Typed cell values shared by the import and export pipelines.
//!
//! Every field that leaves the coercion engine is one of the variants below.
//! The same enum flows into the binary bulk encoder on the way in and into
//! the serializers on the way out, so both directions stay exhaustive.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text layout used for dates and timestamps in exported files.
pub const EXPORT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "integer",
            Value::Float(_) => "double",
            Value::Bool(_) => "boolean",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::Text(_) => "text",
        }
    }

    /// String form used when building duplicate keys.
    ///
    /// `Null` contributes the empty string and text is trimmed, so a key
    /// built from freshly parsed rows matches one built from stored rows.
    pub fn key_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.format(EXPORT_DATETIME_FORMAT).to_string(),
            Value::Text(s) => s.trim().to_string(),
        }
    }

    /// Rendering used by the export serializers; `None` for null.
    pub fn export_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Bool(true) => Some("true".to_string()),
            Value::Bool(false) => Some("false".to_string()),
            Value::Date(d) => Some(d.and_time(NaiveTime::MIN).format(EXPORT_DATETIME_FORMAT).to_string()),
            Value::Timestamp(ts) => Some(ts.format(EXPORT_DATETIME_FORMAT).to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.export_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_export_text_formats() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            Value::Date(date).export_text().as_deref(),
            Some("2024-03-09 00:00:00")
        );

        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 1).unwrap();
        assert_eq!(
            Value::Timestamp(ts).export_text().as_deref(),
            Some("2024-03-09 17:05:01")
        );

        assert_eq!(Value::Bool(true).export_text().as_deref(), Some("true"));
        assert_eq!(Value::Bool(false).export_text().as_deref(), Some("false"));
        assert_eq!(Value::Float(12.5).export_text().as_deref(), Some("12.5"));
        assert_eq!(Value::Null.export_text(), None);
    }

    #[test]
    fn test_key_text_trims_and_blanks_null() {
        assert_eq!(Value::Text("  A ".to_string()).key_text(), "A");
        assert_eq!(Value::Null.key_text(), "");
        assert_eq!(Value::Int(-7).key_text(), "-7");
    }

    #[test]
    fn test_json_shape_is_tagged() {
        let json = serde_json::to_value(Value::Int(5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "int", "value": 5}));

        let back: Value = serde_json::from_value(serde_json::json!({"type": "null"})).unwrap();
        assert_eq!(back, Value::Null);
    }
}
