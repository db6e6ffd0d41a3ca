//! PostgreSQL target store.
//!
//! Batches are written with binary `COPY ... FROM STDIN`, one transaction per
//! batch. Duplicate replacement deletes by key with a single `UNNEST` join
//! and reloads the incoming rows through the same copy path.

use crate::schema::{ColumnSchema, Row, RowLayout, WireType};
use crate::store::columns::{KeyColumn, KeyColumns};
use crate::store::encoding::encode_rows;
use crate::store::{
    ExportColumn, ExportQuery, RowReceiver, StorageError, TargetStore, quote_ident, quote_target,
};
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use rocket_db_pools::sqlx::postgres::PgRow;
use rocket_db_pools::sqlx::{self, PgConnection, PgPool, Row as _};
use tokio::sync::mpsc;

/// Rows buffered between the database cursor and the export serializer.
const STREAM_BUFFER: usize = 256;

#[derive(Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn table_name(target: &str) -> Result<String, StorageError> {
    quote_target(target).map_err(StorageError::InvalidIdentifier)
}

fn column_list<'a>(names: impl Iterator<Item = &'a String>) -> Result<String, StorageError> {
    let quoted: Result<Vec<String>, String> = names.map(|n| quote_ident(n)).collect();
    Ok(quoted.map_err(StorageError::InvalidIdentifier)?.join(", "))
}

fn cast(wire_type: WireType) -> &'static str {
    match wire_type {
        WireType::Text => "text",
        WireType::Int8 => "bigint",
        WireType::Float8 => "double precision",
        WireType::Bool => "boolean",
        WireType::Date => "date",
        WireType::TimestampTz => "timestamptz",
    }
}

fn select_list(columns: &[ExportColumn]) -> Result<String, StorageError> {
    let exprs: Result<Vec<String>, String> = columns
        .iter()
        .map(|c| quote_ident(&c.name).map(|q| format!("{}::{}", q, cast(c.wire_type))))
        .collect();
    Ok(exprs.map_err(StorageError::InvalidIdentifier)?.join(", "))
}

fn schema_columns(columns: &[ColumnSchema]) -> Vec<ExportColumn> {
    columns
        .iter()
        .map(|c| ExportColumn {
            name: c.name.clone(),
            wire_type: WireType::from(c.column_type),
        })
        .collect()
}

/// Build the export `SELECT`. The filter is passed through untouched.
pub fn build_select(query: &ExportQuery) -> Result<String, StorageError> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list(&query.columns)?,
        table_name(&query.source)?
    );

    if let Some(filter) = query.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    Ok(sql)
}

fn decode_row(row: &PgRow, wire_types: &[WireType]) -> Result<Vec<Value>, sqlx::Error> {
    wire_types
        .iter()
        .enumerate()
        .map(|(idx, wire_type)| decode_value(row, idx, *wire_type))
        .collect()
}

fn decode_value(row: &PgRow, idx: usize, wire_type: WireType) -> Result<Value, sqlx::Error> {
    let value = match wire_type {
        WireType::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
        WireType::Int8 => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        WireType::Float8 => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        WireType::Bool => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        WireType::Date => row.try_get::<Option<NaiveDate>, _>(idx)?.map(Value::Date),
        WireType::TimestampTz => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(Value::Timestamp),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Stream one encoded batch into `target` over an open connection.
async fn copy_rows(
    conn: &mut PgConnection,
    target: &str,
    layout: &RowLayout,
    rows: &[Row],
) -> Result<u64, StorageError> {
    let payload = encode_rows(layout, rows)?;
    let statement = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
        table_name(target)?,
        column_list(layout.names().iter())?
    );

    let mut copy = conn.copy_in_raw(&statement).await?;
    if let Err(err) = copy.send(payload).await {
        let _ = copy.abort(err.to_string()).await;
        return Err(err.into());
    }
    let written = copy.finish().await?;

    log::trace!("copied {} rows into {}", written, target);
    Ok(written)
}

impl PgTargetStore {
    async fn fetch_columns(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let selected = schema_columns(columns);
        let wire_types: Vec<WireType> = selected.iter().map(|c| c.wire_type).collect();
        let sql = format!(
            "SELECT {} FROM {}",
            select_list(&selected)?,
            table_name(target)?
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            values.push(decode_row(row, &wire_types)?);
        }
        Ok(values)
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn truncate(&self, target: &str) -> Result<(), StorageError> {
        let sql = format!("TRUNCATE TABLE {}", table_name(target)?);
        sqlx::query(&sql).execute(&self.pool).await?;
        log::debug!("truncated {}", target);
        Ok(())
    }

    async fn load_batch(
        &self,
        target: &str,
        layout: &RowLayout,
        rows: &[Row],
    ) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let written = copy_rows(&mut tx, target, layout, rows).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn existing_keys(
        &self,
        target: &str,
        key_columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        self.fetch_columns(target, key_columns).await
    }

    async fn existing_rows(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        self.fetch_columns(target, columns).await
    }

    async fn replace_duplicates(
        &self,
        target: &str,
        layout: &RowLayout,
        rows: &[Row],
    ) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let search = layout.search_columns();
        let mut tx = self.pool.begin().await?;

        if !search.is_empty() {
            let keys = KeyColumns::from_rows(&search, layout.search_positions(), rows)?;
            let table = table_name(target)?;

            let mut arrays = Vec::with_capacity(keys.columns.len());
            let mut aliases = Vec::with_capacity(keys.columns.len());
            let mut predicates = Vec::with_capacity(keys.columns.len());
            for (idx, (name, column)) in keys.names.iter().zip(&keys.columns).enumerate() {
                arrays.push(format!("${}::{}", idx + 1, column.array_type()));
                aliases.push(format!("k{}", idx));
                predicates.push(format!(
                    "existing.{} IS NOT DISTINCT FROM incoming.k{}",
                    quote_ident(name).map_err(StorageError::InvalidIdentifier)?,
                    idx
                ));
            }

            let sql = format!(
                "DELETE FROM {} AS existing USING UNNEST({}) AS incoming({}) WHERE {}",
                table,
                arrays.join(", "),
                aliases.join(", "),
                predicates.join(" AND ")
            );

            let mut query = sqlx::query(&sql);
            for column in keys.columns {
                query = match column {
                    KeyColumn::Text(v) => query.bind(v),
                    KeyColumn::Int(v) => query.bind(v),
                    KeyColumn::Float(v) => query.bind(v),
                    KeyColumn::Bool(v) => query.bind(v),
                    KeyColumn::Date(v) => query.bind(v),
                };
            }
            let deleted = query.execute(&mut *tx).await?.rows_affected();
            log::debug!("removed {} stored duplicates from {}", deleted, target);
        }

        let written = copy_rows(&mut tx, target, layout, rows).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn stream_rows(&self, query: ExportQuery) -> Result<RowReceiver, StorageError> {
        let sql = build_select(&query)?;
        let wire_types: Vec<WireType> = query.columns.iter().map(|c| c.wire_type).collect();
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let pool = self.pool.clone();

        log::debug!("streaming rows: {}", sql);
        tokio::spawn(async move {
            let result = async {
                let mut rows = sqlx::query(&sql).fetch(&pool);
                while let Some(row) = rows.try_next().await? {
                    let values = decode_row(&row, &wire_types)?;
                    if sender.send(Ok(values)).await.is_err() {
                        // receiver dropped, export stopped early
                        break;
                    }
                }
                Ok::<(), sqlx::Error>(())
            }
            .await;

            if let Err(err) = result {
                let _ = sender.send(Err(StorageError::Database(err))).await;
            }
        });

        Ok(receiver)
    }
}
