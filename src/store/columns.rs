//! Columnar key arrays for set-based deletes.
//!
//! Each vector holds one key column for every row of a batch, in row order,
//! so the whole key set can be bound as typed arrays and expanded with
//! `UNNEST` on the server.

use crate::schema::{ColumnSchema, ColumnType, Row, WireType};
use crate::store::StorageError;
use crate::store::encoding::normalize;
use crate::value::Value;
use chrono::NaiveDate;

/// One key column in array form.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyColumn {
    Text(Vec<Option<String>>),
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Date(Vec<Option<NaiveDate>>),
}

impl KeyColumn {
    fn with_capacity(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Text => KeyColumn::Text(Vec::with_capacity(capacity)),
            ColumnType::Integer => KeyColumn::Int(Vec::with_capacity(capacity)),
            ColumnType::Double => KeyColumn::Float(Vec::with_capacity(capacity)),
            ColumnType::Boolean => KeyColumn::Bool(Vec::with_capacity(capacity)),
            ColumnType::Date => KeyColumn::Date(Vec::with_capacity(capacity)),
        }
    }

    /// Array cast used in the `UNNEST` call.
    pub fn array_type(&self) -> &'static str {
        match self {
            KeyColumn::Text(_) => "text[]",
            KeyColumn::Int(_) => "bigint[]",
            KeyColumn::Float(_) => "double precision[]",
            KeyColumn::Bool(_) => "boolean[]",
            KeyColumn::Date(_) => "date[]",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KeyColumn::Text(v) => v.len(),
            KeyColumn::Int(v) => v.len(),
            KeyColumn::Float(v) => v.len(),
            KeyColumn::Bool(v) => v.len(),
            KeyColumn::Date(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, value: Value) -> bool {
        match (self, value) {
            (KeyColumn::Text(v), Value::Null) => v.push(None),
            (KeyColumn::Int(v), Value::Null) => v.push(None),
            (KeyColumn::Float(v), Value::Null) => v.push(None),
            (KeyColumn::Bool(v), Value::Null) => v.push(None),
            (KeyColumn::Date(v), Value::Null) => v.push(None),
            (KeyColumn::Text(v), Value::Text(s)) => v.push(Some(s)),
            (KeyColumn::Int(v), Value::Int(i)) => v.push(Some(i)),
            (KeyColumn::Float(v), Value::Float(f)) => v.push(Some(f)),
            (KeyColumn::Bool(v), Value::Bool(b)) => v.push(Some(b)),
            (KeyColumn::Date(v), Value::Date(d)) => v.push(Some(d)),
            _ => return false,
        }
        true
    }
}

/// Search-column values of a batch, one [`KeyColumn`] per search column.
#[derive(Debug, Clone)]
pub struct KeyColumns {
    pub names: Vec<String>,
    pub columns: Vec<KeyColumn>,
}

impl KeyColumns {
    pub fn from_rows(search: &[&ColumnSchema], positions: &[usize], rows: &[Row]) -> Result<Self, StorageError> {
        let mut columns: Vec<KeyColumn> = search
            .iter()
            .map(|c| KeyColumn::with_capacity(c.column_type, rows.len()))
            .collect();

        for row in rows {
            for ((column, schema), &position) in columns.iter_mut().zip(search).zip(positions) {
                let raw = row.value(position);
                let wire_type = WireType::from(schema.column_type);
                let accepted = normalize(raw, wire_type)
                    .map(|value| column.push(value))
                    .unwrap_or(false);
                if !accepted {
                    return Err(StorageError::Encode {
                        column: schema.name.clone(),
                        value: format!("{} {}", raw.kind(), raw),
                        expected: wire_type.name(),
                    });
                }
            }
        }

        Ok(Self {
            names: search.iter().map(|c| c.name.clone()).collect(),
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RowLayout;

    #[test]
    fn test_key_columns_follow_search_order() {
        let layout = RowLayout::new(vec![
            ColumnSchema::new("id", ColumnType::Integer).duplicate_key(),
            ColumnSchema::new("name", ColumnType::Text),
            ColumnSchema::new("region", ColumnType::Text).duplicate_key(),
        ]);
        let rows = vec![
            Row::new(
                layout.clone(),
                vec![
                    Value::Int(1),
                    Value::Text("a".to_string()),
                    Value::Text("north".to_string()),
                    Value::Null,
                    Value::Null,
                ],
            ),
            Row::new(
                layout.clone(),
                vec![Value::Int(2), Value::Null, Value::Null, Value::Null, Value::Null],
            ),
        ];

        let keys =
            KeyColumns::from_rows(&layout.search_columns(), layout.search_positions(), &rows)
                .unwrap();
        assert_eq!(keys.names, vec!["id", "region"]);
        assert_eq!(keys.columns[0], KeyColumn::Int(vec![Some(1), Some(2)]));
        assert_eq!(
            keys.columns[1],
            KeyColumn::Text(vec![Some("north".to_string()), None])
        );
        assert_eq!(keys.columns[1].array_type(), "text[]");
    }
}
