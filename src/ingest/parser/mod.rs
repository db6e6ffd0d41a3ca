//! Streaming row parsers.
//!
//! Both formats yield positional [`RawRecord`]s; the shared [`RowBuilder`]
//! turns a record into a typed [`Row`] or the list of problems that excluded
//! it. Neither parser holds more than one record in memory.

pub mod delimited;
pub mod markup;

pub use delimited::DelimitedReader;
pub use markup::MarkupReader;

use crate::ingest::coercion::coerce;
use crate::ingest::errors::{ImportError, ImportFailure};
use crate::schema::{FileFormat, FormatOptions, Row, RowLayout};
use crate::value::Value;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// One untyped input row. `None` marks a field missing from the input.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub row_number: u64,
    pub fields: Vec<Option<String>>,
}

/// Format-independent record source.
pub enum RecordReader<R> {
    Delimited(DelimitedReader<R>),
    Markup(MarkupReader<R>),
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn open(format: FileFormat, input: R, options: &FormatOptions) -> Result<Self, ImportFailure> {
        Ok(match format {
            FileFormat::Delimited => RecordReader::Delimited(DelimitedReader::new(input, options)?),
            FileFormat::Markup => RecordReader::Markup(MarkupReader::new(input, options)),
        })
    }

    /// Next data record, or `None` once the input is exhausted.
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, ImportFailure> {
        match self {
            RecordReader::Delimited(reader) => reader.next_record().await,
            RecordReader::Markup(reader) => reader.next_record().await,
        }
    }
}

/// Types raw records against the job layout and stamps the synthetic columns.
pub struct RowBuilder {
    layout: Arc<RowLayout>,
    actor: String,
}

impl RowBuilder {
    pub fn new(layout: Arc<RowLayout>, actor: impl Into<String>) -> Self {
        Self {
            layout,
            actor: actor.into(),
        }
    }

    /// Build a typed row, or every problem found in the record.
    pub fn build(&self, record: &RawRecord) -> Result<Row, Vec<ImportError>> {
        let mut values = Vec::with_capacity(self.layout.width());
        let mut errors = Vec::new();

        for (idx, column) in self.layout.user_columns().iter().enumerate() {
            let raw = record
                .fields
                .get(idx)
                .and_then(|field| field.as_deref())
                .unwrap_or_default();

            match coerce(raw, column.column_type) {
                Ok(Value::Null) if !column.accepts_null() => {
                    errors.push(ImportError::missing_required(record.row_number, &column.name));
                }
                Ok(value) => values.push(value),
                Err(err) => errors.push(ImportError::type_conversion(
                    record.row_number,
                    &column.name,
                    raw,
                    err.to_string(),
                )),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        values.push(Value::Timestamp(Utc::now()));
        values.push(Value::Text(self.actor.clone()));
        Ok(Row::new(self.layout.clone(), values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, LAST_MODIFIED_BY};

    fn builder() -> RowBuilder {
        RowBuilder::new(
            RowLayout::new(vec![
                ColumnSchema::new("id", ColumnType::Integer).primary_key(),
                ColumnSchema::new("name", ColumnType::Text),
                ColumnSchema::new("score", ColumnType::Double),
            ]),
            "alice",
        )
    }

    fn record(fields: &[&str]) -> RawRecord {
        RawRecord {
            row_number: 4,
            fields: fields.iter().map(|f| Some(f.to_string())).collect(),
        }
    }

    #[test]
    fn test_short_record_yields_trailing_nulls() {
        let row = builder().build(&record(&["1", "bob"])).unwrap();
        assert_eq!(row.get("score"), Some(&Value::Null));
        assert_eq!(
            row.get(LAST_MODIFIED_BY),
            Some(&Value::Text("alice".to_string()))
        );
        assert!(matches!(row.get("last_modified_at"), Some(Value::Timestamp(_))));
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let row = builder()
            .build(&record(&["1", "bob", "2,5", "surplus", "more"]))
            .unwrap();
        assert_eq!(row.values().len(), 5);
        assert_eq!(row.get("score"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn test_blank_primary_key_is_a_row_error() {
        let column: ColumnSchema =
            serde_json::from_str(r#"{"name": "id", "type": "integer", "isPrimaryKey": true}"#).unwrap();
        assert!(!column.required);
        let builder = RowBuilder::new(
            RowLayout::new(vec![column, ColumnSchema::new("name", ColumnType::Text)]),
            "alice",
        );

        let errors = builder.build(&record(&["", "Ann"])).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].column.as_deref(), Some("id"));
        assert!(builder.build(&record(&["2", "Bob"])).is_ok());
    }

    #[test]
    fn test_every_problem_is_reported() {
        let errors = builder().build(&record(&["", "bob", "high"])).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].column.as_deref(), Some("id"));
        assert!(errors[0].message.contains("required"));
        assert_eq!(errors[1].column.as_deref(), Some("score"));
        assert_eq!(errors[1].original_value.as_deref(), Some("high"));
        assert!(errors.iter().all(|e| e.row_number == 4));
    }
}
