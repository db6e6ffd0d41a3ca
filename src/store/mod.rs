//! Storage seams used by the import and export engines.
//!
//! The engines only talk to [`TargetStore`] and [`SchemaCatalog`]. The
//! PostgreSQL implementations live in [`postgres`] and [`catalog`]; tests use
//! the in-memory pair from `test_support::memory`.

pub mod catalog;
pub mod columns;
pub mod encoding;
pub mod migration;
pub mod postgres;

pub use catalog::PgSchemaCatalog;
pub use migration::run_migrations;
pub use postgres::PgTargetStore;

use crate::schema::{ColumnSchema, Row, RowLayout, WireType};
use crate::value::Value;
use async_trait::async_trait;
use rocket_db_pools::sqlx;
use thiserror::Error;
use tokio::sync::mpsc;

/// Rows read back from a source, positional against [`ExportQuery::columns`].
pub type RowReceiver = mpsc::Receiver<Result<Vec<Value>, StorageError>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("column '{column}' cannot store {value} as {expected}")]
    Encode {
        column: String,
        value: String,
        expected: &'static str,
    },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("target '{0}' does not exist")]
    UnknownTarget(String),
    #[error("target '{target}' has no column '{column}'")]
    UnknownColumn { target: String, column: String },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Column selected by an export, with the encoding used to decode it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportColumn {
    pub name: String,
    pub wire_type: WireType,
}

/// Resolved export query handed to the store.
#[derive(Debug, Clone)]
pub struct ExportQuery {
    pub source: String,
    pub columns: Vec<ExportColumn>,
    pub filter: Option<String>,
    pub limit: Option<u64>,
}

/// Row storage for one relational target.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Remove every row from the target.
    async fn truncate(&self, target: &str) -> Result<(), StorageError>;

    /// Load one batch in a single transaction. Returns the committed row count.
    async fn load_batch(
        &self,
        target: &str,
        layout: &RowLayout,
        rows: &[Row],
    ) -> Result<u64, StorageError>;

    /// Key column values of every stored row, positional against `key_columns`.
    async fn existing_keys(
        &self,
        target: &str,
        key_columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError>;

    /// Full snapshot of stored rows, positional against `columns`.
    async fn existing_rows(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError>;

    /// Delete the stored rows matching each incoming row on the layout's
    /// search columns, then load the incoming rows, all in one transaction.
    async fn replace_duplicates(
        &self,
        target: &str,
        layout: &RowLayout,
        rows: &[Row],
    ) -> Result<u64, StorageError>;

    /// Start streaming the rows selected by `query`.
    async fn stream_rows(&self, query: ExportQuery) -> Result<RowReceiver, StorageError>;
}

/// Table metadata: existence, declared columns and creation.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn target_exists(&self, target: &str) -> Result<bool, CatalogError>;

    /// User columns of the target in ordinal order, synthetic columns excluded.
    async fn get_columns(&self, target: &str) -> Result<Vec<ColumnSchema>, CatalogError>;

    async fn create_target(&self, target: &str, columns: &[ColumnSchema])
    -> Result<(), CatalogError>;

    async fn save_column_metadata(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<(), CatalogError>;
}

/// Double-quote one identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> Result<String, String> {
    if name.is_empty() || name.contains('\0') {
        return Err(format!("'{}' is not a valid identifier", name.escape_debug()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a possibly schema-qualified target name (`schema.table`).
pub fn quote_target(target: &str) -> Result<String, String> {
    let parts: Vec<&str> = target.split('.').collect();
    if parts.len() > 2 {
        return Err(format!("'{}' has too many name parts", target));
    }
    let quoted: Result<Vec<String>, String> = parts.iter().map(|p| quote_ident(p)).collect();
    Ok(quoted?.join("."))
}

/// Split a target into `(schema, table)`, defaulting the schema to `public`.
pub fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("name").unwrap(), "\"name\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_quote_target_handles_schema() {
        assert_eq!(quote_target("people").unwrap(), "\"people\"");
        assert_eq!(quote_target("crm.people").unwrap(), "\"crm\".\"people\"");
        assert!(quote_target("a.b.c").is_err());
        assert!(quote_target("crm.").is_err());
        assert_eq!(split_target("people"), ("public", "people"));
        assert_eq!(split_target("crm.people"), ("crm", "people"));
    }
}
