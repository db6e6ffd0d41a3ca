//! In-memory [`TargetStore`] and [`SchemaCatalog`] for exercising the
//! engines and routes without a database.
//!
//! Batches still go through the binary copy encoder, so a row the real
//! store would reject is rejected here too.

use crate::ingest::duplicates::key_of;
use crate::schema::{ColumnSchema, Row, RowLayout};
use crate::store::encoding::{encode_rows, normalize};
use crate::store::{
    CatalogError, ExportQuery, RowReceiver, SchemaCatalog, StorageError, TargetStore,
};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

type NamedRow = BTreeMap<String, Value>;

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<ColumnSchema>,
    rows: Vec<NamedRow>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    metadata: HashSet<String>,
    fail_on: Option<Value>,
    committed_batches: Vec<usize>,
}

/// Shared backing state; clones see the same tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

fn project(row: &NamedRow, names: impl IntoIterator<Item = String>) -> Vec<Value> {
    names
        .into_iter()
        .map(|name| row.get(&name).cloned().unwrap_or(Value::Null))
        .collect()
}

fn stored_form(layout: &RowLayout, row: &Row) -> NamedRow {
    layout
        .names()
        .iter()
        .zip(layout.wire_types())
        .zip(row.values())
        .map(|((name, wire_type), value)| {
            let stored = normalize(value, *wire_type).unwrap_or_else(|| value.clone());
            (name.clone(), stored)
        })
        .collect()
}

fn missing(target: &str) -> StorageError {
    StorageError::Backend(format!("relation \"{target}\" does not exist"))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> Arc<dyn TargetStore> {
        Arc::new(self.clone())
    }

    pub fn catalog(&self) -> Arc<dyn SchemaCatalog> {
        Arc::new(self.clone())
    }

    /// Register a table the way a migration or an earlier import would have.
    pub async fn create_table(&self, target: &str, columns: Vec<ColumnSchema>) {
        self.state.lock().await.tables.insert(
            target.to_string(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Seed stored rows directly, bypassing the batch path.
    pub async fn seed_rows(&self, target: &str, rows: Vec<NamedRow>) {
        if let Some(table) = self.state.lock().await.tables.get_mut(target) {
            table.rows.extend(rows);
        }
    }

    /// Fail every batch that contains `value` in any column.
    pub async fn fail_batches_containing(&self, value: Value) {
        self.state.lock().await.fail_on = Some(value);
    }

    pub async fn rows(&self, target: &str) -> Vec<NamedRow> {
        self.state
            .lock()
            .await
            .tables
            .get(target)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, target: &str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(target)
            .map(|table| table.rows.len())
            .unwrap_or(0)
    }

    /// Sizes of committed batches in commit order.
    pub async fn committed_batches(&self) -> Vec<usize> {
        self.state.lock().await.committed_batches.clone()
    }

    pub async fn has_metadata(&self, target: &str) -> bool {
        self.state.lock().await.metadata.contains(target)
    }
}

#[async_trait]
impl TargetStore for MemoryBackend {
    async fn truncate(&self, target: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let table = state.tables.get_mut(target).ok_or_else(|| missing(target))?;
        table.rows.clear();
        Ok(())
    }

    async fn load_batch(
        &self,
        target: &str,
        layout: &RowLayout,
        rows: &[Row],
    ) -> Result<u64, StorageError> {
        encode_rows(layout, rows)?;
        for column in layout.user_columns().iter().filter(|c| !c.accepts_null()) {
            if rows.iter().any(|row| row.get(&column.name) == Some(&Value::Null)) {
                return Err(StorageError::Backend(format!(
                    "null value in column '{}' violates not-null constraint",
                    column.name
                )));
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(poison) = &state.fail_on {
            if rows.iter().any(|row| row.values().contains(poison)) {
                return Err(StorageError::Backend(format!("forced failure on {poison}")));
            }
        }

        let table = state.tables.get_mut(target).ok_or_else(|| missing(target))?;
        table.rows.extend(rows.iter().map(|row| stored_form(layout, row)));
        state.committed_batches.push(rows.len());
        Ok(rows.len() as u64)
    }

    async fn existing_keys(
        &self,
        target: &str,
        key_columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        self.existing_rows(target, key_columns).await
    }

    async fn existing_rows(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        let state = self.state.lock().await;
        let table = state.tables.get(target).ok_or_else(|| missing(target))?;
        Ok(table
            .rows
            .iter()
            .map(|row| project(row, columns.iter().map(|c| c.name.clone())))
            .collect())
    }

    async fn replace_duplicates(
        &self,
        target: &str,
        layout: &RowLayout,
        rows: &[Row],
    ) -> Result<u64, StorageError> {
        encode_rows(layout, rows)?;

        let key_names: Vec<String> = layout
            .search_columns()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let incoming: Vec<NamedRow> = rows.iter().map(|row| stored_form(layout, row)).collect();
        let keys: HashSet<String> = incoming
            .iter()
            .map(|row| key_of(&project(row, key_names.iter().cloned())))
            .collect();

        let mut state = self.state.lock().await;
        let table = state.tables.get_mut(target).ok_or_else(|| missing(target))?;
        table
            .rows
            .retain(|row| !keys.contains(&key_of(&project(row, key_names.iter().cloned()))));
        table.rows.extend(incoming);
        Ok(rows.len() as u64)
    }

    /// Filters are not evaluated; `limit` is.
    async fn stream_rows(&self, query: ExportQuery) -> Result<RowReceiver, StorageError> {
        let selected: Vec<Result<Vec<Value>, StorageError>> = {
            let state = self.state.lock().await;
            let table = state
                .tables
                .get(&query.source)
                .ok_or_else(|| missing(&query.source))?;
            let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);

            table
                .rows
                .iter()
                .take(limit)
                .map(|row| {
                    Ok(query
                        .columns
                        .iter()
                        .map(|column| {
                            let value = row.get(&column.name).cloned().unwrap_or(Value::Null);
                            normalize(&value, column.wire_type).unwrap_or(value)
                        })
                        .collect())
                })
                .collect()
        };

        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(async move {
            for row in selected {
                if sender.send(row).await.is_err() {
                    break;
                }
            }
        });
        Ok(receiver)
    }
}

#[async_trait]
impl SchemaCatalog for MemoryBackend {
    async fn target_exists(&self, target: &str) -> Result<bool, CatalogError> {
        Ok(self.state.lock().await.tables.contains_key(target))
    }

    async fn get_columns(&self, target: &str) -> Result<Vec<ColumnSchema>, CatalogError> {
        self.state
            .lock()
            .await
            .tables
            .get(target)
            .map(|table| table.columns.clone())
            .ok_or_else(|| CatalogError::UnknownTarget(target.to_string()))
    }

    async fn create_target(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<(), CatalogError> {
        self.create_table(target, columns.to_vec()).await;
        Ok(())
    }

    async fn save_column_metadata(
        &self,
        target: &str,
        _columns: &[ColumnSchema],
    ) -> Result<(), CatalogError> {
        self.state.lock().await.metadata.insert(target.to_string());
        Ok(())
    }
}
