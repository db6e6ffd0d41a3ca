//! PostgreSQL schema catalog backed by `information_schema` and the
//! `loader_column_metadata` table.

use crate::schema::{
    ColumnSchema, ColumnType, LAST_MODIFIED_AT, LAST_MODIFIED_BY, is_synthetic,
};
use crate::store::{CatalogError, SchemaCatalog, quote_ident, quote_target, split_target};
use async_trait::async_trait;
use rocket_db_pools::sqlx::{self, PgPool};

type ColumnRow = (
    String,
    String,
    String,
    Option<String>,
    Option<bool>,
    Option<bool>,
    Option<bool>,
);

#[derive(Clone)]
pub struct PgSchemaCatalog {
    pool: PgPool,
}

impl PgSchemaCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a PostgreSQL data type onto the closest column type.
fn column_type_for(data_type: &str) -> ColumnType {
    match data_type {
        "smallint" | "integer" | "bigint" => ColumnType::Integer,
        "real" | "double precision" | "numeric" => ColumnType::Double,
        "boolean" => ColumnType::Boolean,
        "date" => ColumnType::Date,
        dt if dt.starts_with("timestamp") => ColumnType::Date,
        _ => ColumnType::Text,
    }
}

/// `CREATE TABLE` statement for a new target, synthetic columns included.
pub fn create_table_sql(target: &str, columns: &[ColumnSchema]) -> Result<String, CatalogError> {
    let table = quote_target(target).map_err(CatalogError::InvalidIdentifier)?;

    let mut definitions = Vec::with_capacity(columns.len() + 3);
    let mut primary_key = Vec::new();
    for column in columns {
        let name = quote_ident(&column.name).map_err(CatalogError::InvalidIdentifier)?;
        let mut definition = format!("{} {}", name, column.column_type.sql_type());
        if !column.accepts_null() {
            definition.push_str(" NOT NULL");
        }
        if column.is_primary_key {
            primary_key.push(name);
        }
        definitions.push(definition);
    }

    definitions.push(format!("\"{}\" TIMESTAMPTZ", LAST_MODIFIED_AT));
    definitions.push(format!("\"{}\" TEXT", LAST_MODIFIED_BY));
    if !primary_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", primary_key.join(", ")));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table,
        definitions.join(", ")
    ))
}

#[async_trait]
impl SchemaCatalog for PgSchemaCatalog {
    async fn target_exists(&self, target: &str) -> Result<bool, CatalogError> {
        let qualified = quote_target(target).map_err(CatalogError::InvalidIdentifier)?;
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(qualified)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn get_columns(&self, target: &str) -> Result<Vec<ColumnSchema>, CatalogError> {
        let (schema, table) = split_target(target);

        let rows: Vec<ColumnRow> = sqlx::query_as(
            r#"SELECT c.column_name::text,
                      c.data_type::text,
                      c.is_nullable::text,
                      m.column_type,
                      m.is_required,
                      m.is_primary_key,
                      m.participates_in_duplicate_key
               FROM information_schema.columns c
               LEFT JOIN loader_column_metadata m
                 ON m.table_schema = c.table_schema::text
                AND m.table_name = c.table_name::text
                AND m.column_name = c.column_name::text
               WHERE c.table_schema = $1 AND c.table_name = $2
               ORDER BY c.ordinal_position"#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(CatalogError::UnknownTarget(target.to_string()));
        }

        let columns = rows
            .into_iter()
            .filter(|(name, ..)| !is_synthetic(name))
            .map(
                |(name, data_type, nullable, declared, required, primary, duplicate)| {
                    let column_type = declared
                        .as_deref()
                        .and_then(ColumnType::parse)
                        .unwrap_or_else(|| column_type_for(&data_type));
                    ColumnSchema {
                        name,
                        column_type,
                        required: required.unwrap_or(nullable == "NO"),
                        is_primary_key: primary.unwrap_or(false),
                        participates_in_duplicate_key: duplicate.unwrap_or(false),
                    }
                },
            )
            .collect();

        Ok(columns)
    }

    async fn create_target(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<(), CatalogError> {
        let sql = create_table_sql(target, columns)?;
        sqlx::query(&sql).execute(&self.pool).await?;
        log::info!("created target {} with {} columns", target, columns.len());
        Ok(())
    }

    async fn save_column_metadata(
        &self,
        target: &str,
        columns: &[ColumnSchema],
    ) -> Result<(), CatalogError> {
        let (schema, table) = split_target(target);

        let mut names = Vec::with_capacity(columns.len() + 2);
        let mut types = Vec::with_capacity(columns.len() + 2);
        let mut ordinals = Vec::with_capacity(columns.len() + 2);
        let mut required = Vec::with_capacity(columns.len() + 2);
        let mut primary = Vec::with_capacity(columns.len() + 2);
        let mut duplicate = Vec::with_capacity(columns.len() + 2);
        let mut synthetic = Vec::with_capacity(columns.len() + 2);

        for (idx, column) in columns.iter().enumerate() {
            names.push(column.name.clone());
            types.push(column.column_type.as_str().to_string());
            ordinals.push(idx as i32 + 1);
            required.push(column.required);
            primary.push(column.is_primary_key);
            duplicate.push(column.participates_in_duplicate_key);
            synthetic.push(false);
        }
        for (offset, (name, kind)) in [(LAST_MODIFIED_AT, "timestamp"), (LAST_MODIFIED_BY, "text")]
            .into_iter()
            .enumerate()
        {
            names.push(name.to_string());
            types.push(kind.to_string());
            ordinals.push((columns.len() + offset) as i32 + 1);
            required.push(false);
            primary.push(false);
            duplicate.push(false);
            synthetic.push(true);
        }

        sqlx::query(
            r#"INSERT INTO loader_column_metadata (
                   table_schema, table_name, column_name, column_type, ordinal,
                   is_required, is_primary_key, participates_in_duplicate_key, is_synthetic
               )
               SELECT $1, $2, column_name, column_type, ordinal,
                      is_required, is_primary_key, participates_in_duplicate_key, is_synthetic
               FROM UNNEST($3::text[], $4::text[], $5::int[], $6::bool[], $7::bool[], $8::bool[], $9::bool[])
                    AS t(column_name, column_type, ordinal, is_required, is_primary_key,
                         participates_in_duplicate_key, is_synthetic)
               ON CONFLICT (table_schema, table_name, column_name) DO UPDATE
               SET column_type = EXCLUDED.column_type,
                   ordinal = EXCLUDED.ordinal,
                   is_required = EXCLUDED.is_required,
                   is_primary_key = EXCLUDED.is_primary_key,
                   participates_in_duplicate_key = EXCLUDED.participates_in_duplicate_key,
                   is_synthetic = EXCLUDED.is_synthetic,
                   updated_at = NOW()"#,
        )
        .bind(schema)
        .bind(table)
        .bind(&names)
        .bind(&types)
        .bind(&ordinals)
        .bind(&required)
        .bind(&primary)
        .bind(&duplicate)
        .bind(&synthetic)
        .execute(&self.pool)
        .await?;

        log::debug!("saved metadata for {} columns of {}", names.len(), target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(
            "people",
            &[
                ColumnSchema::new("id", ColumnType::Integer).primary_key(),
                ColumnSchema::new("score", ColumnType::Double),
                ColumnSchema::new("born", ColumnType::Date).required(),
            ],
        )
        .unwrap();

        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"people\" (\"id\" BIGINT NOT NULL, \"score\" DOUBLE PRECISION, \
             \"born\" DATE NOT NULL, \"last_modified_at\" TIMESTAMPTZ, \"last_modified_by\" TEXT, \
             PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_column_type_mapping() {
        assert_eq!(column_type_for("bigint"), ColumnType::Integer);
        assert_eq!(column_type_for("numeric"), ColumnType::Double);
        assert_eq!(column_type_for("timestamp with time zone"), ColumnType::Date);
        assert_eq!(column_type_for("character varying"), ColumnType::Text);
    }
}
