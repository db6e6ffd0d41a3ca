//! Row-level diagnostics and fatal import failures.

use crate::store::{CatalogError, StorageError};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A problem with one row. The row is excluded and the job continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    /// 1-based data row number, not counting header or skipped rows.
    pub row_number: u64,
    pub column: Option<String>,
    pub message: String,
    pub original_value: Option<String>,
}

impl ImportError {
    pub fn type_conversion(row_number: u64, column: &str, raw: &str, message: String) -> Self {
        Self {
            row_number,
            column: Some(column.to_string()),
            message,
            original_value: Some(raw.to_string()),
        }
    }

    pub fn missing_required(row_number: u64, column: &str) -> Self {
        Self {
            row_number,
            column: Some(column.to_string()),
            message: format!("required field '{}' is empty", column),
            original_value: None,
        }
    }
}

/// Ordered collection of row diagnostics for one job.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Vec<ImportError>,
    failed_rows: u64,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every diagnostic raised by one row; the row counts once.
    pub fn record_row(&mut self, errors: Vec<ImportError>) {
        if errors.is_empty() {
            return;
        }
        self.failed_rows += 1;
        self.errors.extend(errors);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed_rows(&self) -> u64 {
        self.failed_rows
    }

    pub fn into_errors(self) -> Vec<ImportError> {
        self.errors
    }
}

/// Conditions that stop an import.
#[derive(Debug, Error)]
pub enum ImportFailure {
    #[error("malformed input at row {row}: {message}")]
    ParseStructure { row: u64, message: String },
    #[error("{stage} failed: {source}")]
    Storage {
        stage: String,
        #[source]
        source: StorageError,
    },
    #[error("import cancelled")]
    Cancelled,
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl ImportFailure {
    pub fn storage(stage: impl Into<String>, source: StorageError) -> Self {
        ImportFailure::Storage {
            stage: stage.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregator_counts_rows_not_errors() {
        let mut errors = ErrorAggregator::new();
        errors.record_row(vec![
            ImportError::missing_required(3, "id"),
            ImportError::type_conversion(3, "age", "x", "bad".to_string()),
        ]);
        errors.record_row(Vec::new());
        errors.record_row(vec![ImportError::missing_required(7, "id")]);

        assert_eq!(errors.len(), 3);
        assert_eq!(errors.failed_rows(), 2);
        let rows: Vec<u64> = errors.into_errors().iter().map(|e| e.row_number).collect();
        assert_eq!(rows, vec![3, 3, 7]);
    }

    #[test]
    fn test_error_serializes_camel_case() {
        let json = serde_json::to_value(ImportError::missing_required(2, "name")).unwrap();
        assert_eq!(json["rowNumber"], 2);
        assert_eq!(json["column"], "name");
        assert!(json["originalValue"].is_null());
    }
}
