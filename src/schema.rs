//! Caller-supplied column schema, row layout and job requests.
//!
//! A job's schema is fixed when the job starts. [`RowLayout`] extends it with
//! the two synthetic tracking columns and is shared by every [`Row`] the job
//! produces, so rows carry positional values only.

use crate::value::Value;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Synthetic column holding the time a row was last written.
pub const LAST_MODIFIED_AT: &str = "last_modified_at";
/// Synthetic column holding the actor that last wrote a row.
pub const LAST_MODIFIED_BY: &str = "last_modified_by";

pub fn is_synthetic(name: &str) -> bool {
    name == LAST_MODIFIED_AT || name == LAST_MODIFIED_BY
}

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Double,
    Boolean,
    Date,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(ColumnType::Text),
            "integer" => Some(ColumnType::Integer),
            "double" => Some(ColumnType::Double),
            "boolean" => Some(ColumnType::Boolean),
            "date" => Some(ColumnType::Date),
            _ => None,
        }
    }

    /// PostgreSQL type used when creating a target column.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
        }
    }
}

/// Schema entry for one user column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub participates_in_duplicate_key: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            required: false,
            is_primary_key: false,
            participates_in_duplicate_key: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.required = true;
        self
    }

    pub fn duplicate_key(mut self) -> Self {
        self.participates_in_duplicate_key = true;
        self
    }

    /// Primary key columns are non-null even when `required` is unset.
    pub fn accepts_null(&self) -> bool {
        !(self.required || self.is_primary_key)
    }
}

/// Physical encoding of a layout position in the bulk-load stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Text,
    Int8,
    Float8,
    Bool,
    Date,
    TimestampTz,
}

impl From<ColumnType> for WireType {
    fn from(value: ColumnType) -> Self {
        match value {
            ColumnType::Text => WireType::Text,
            ColumnType::Integer => WireType::Int8,
            ColumnType::Double => WireType::Float8,
            ColumnType::Boolean => WireType::Bool,
            ColumnType::Date => WireType::Date,
        }
    }
}

/// User columns plus the synthetic tracking columns, in load order.
#[derive(Debug, Clone)]
pub struct RowLayout {
    columns: Vec<ColumnSchema>,
    names: Vec<String>,
    wire_types: Vec<WireType>,
    search_positions: Vec<usize>,
}

impl RowLayout {
    pub fn new(columns: Vec<ColumnSchema>) -> Arc<Self> {
        let mut names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        names.push(LAST_MODIFIED_AT.to_string());
        names.push(LAST_MODIFIED_BY.to_string());

        let mut wire_types: Vec<WireType> =
            columns.iter().map(|c| WireType::from(c.column_type)).collect();
        wire_types.push(WireType::TimestampTz);
        wire_types.push(WireType::Text);

        let search_positions = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.participates_in_duplicate_key)
            .map(|(idx, _)| idx)
            .collect();

        Arc::new(Self {
            columns,
            names,
            wire_types,
            search_positions,
        })
    }

    /// Columns read from input, without the synthetic ones.
    pub fn user_columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn user_width(&self) -> usize {
        self.columns.len()
    }

    /// All column names including the synthetic pair.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn width(&self) -> usize {
        self.names.len()
    }

    pub fn wire_types(&self) -> &[WireType] {
        &self.wire_types
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Positions of the columns that make up the duplicate key.
    pub fn search_positions(&self) -> &[usize] {
        &self.search_positions
    }

    pub fn search_columns(&self) -> Vec<&ColumnSchema> {
        self.search_positions.iter().map(|&idx| &self.columns[idx]).collect()
    }

    pub fn has_search_columns(&self) -> bool {
        !self.search_positions.is_empty()
    }
}

/// One typed row. Values are positional against the shared layout.
#[derive(Debug, Clone)]
pub struct Row {
    layout: Arc<RowLayout>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(layout: Arc<RowLayout>, values: Vec<Value>) -> Self {
        debug_assert_eq!(layout.width(), values.len());
        Self { layout, values }
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, position: usize) -> &Value {
        &self.values[position]
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.layout.position(name).map(|idx| &self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.layout
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Detached name → value form used on the wire.
    pub fn to_named(&self) -> BTreeMap<String, Value> {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    /// Rebuild a row from its detached form; missing columns become null.
    pub fn from_named(layout: Arc<RowLayout>, named: &BTreeMap<String, Value>) -> Self {
        let values = layout
            .names()
            .iter()
            .map(|name| named.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        Self { layout, values }
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.layout.names() == other.layout.names() && self.values == other.values
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Input and output file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Delimited,
    Markup,
}

impl FileFormat {
    /// Detect the format from the declared content type, then the file extension.
    pub fn detect(content_type: Option<&str>, file_name: Option<&str>) -> Option<Self> {
        if let Some(format) = content_type.and_then(Self::from_content_type) {
            return Some(format);
        }

        let extension = file_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())?;

        match extension.as_str() {
            "csv" | "tsv" | "txt" => Some(FileFormat::Delimited),
            "xml" => Some(FileFormat::Markup),
            _ => None,
        }
    }

    fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "text/csv" | "application/csv" | "text/tab-separated-values" | "text/plain" => {
                Some(FileFormat::Delimited)
            }
            "application/xml" | "text/xml" => Some(FileFormat::Markup),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Delimited => "csv",
            FileFormat::Markup => "xml",
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

/// Format-specific options shared by import and export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default)]
    pub root_element: Option<String>,
    #[serde(default)]
    pub row_element: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            has_header: true,
            skip_rows: 0,
            root_element: None,
            row_element: None,
        }
    }
}

impl FormatOptions {
    /// Delimiter as a single byte; only ASCII delimiters are accepted.
    pub fn delimiter_byte(&self) -> Result<u8, String> {
        if self.delimiter.is_ascii() && self.delimiter != '"' && self.delimiter != '\n' {
            Ok(self.delimiter as u8)
        } else {
            Err(format!("unsupported delimiter {:?}", self.delimiter))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    #[default]
    Insert,
    Replace,
}

/// Everything the engine needs to run one import.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobRequest {
    pub target: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub options: FormatOptions,
    #[serde(default)]
    pub mode: ImportMode,
    #[serde(default)]
    pub is_new_target: bool,
    /// Recorded in `last_modified_by`; the server default applies when blank.
    #[serde(default)]
    pub actor: String,
}

impl ImportJobRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err("target name is empty".to_string());
        }
        if self.columns.is_empty() {
            return Err("schema has no columns".to_string());
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err("column name is empty".to_string());
            }
            if is_synthetic(&column.name) {
                return Err(format!("column name '{}' is reserved", column.name));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(format!("column '{}' is declared twice", column.name));
            }
        }

        if self.is_new_target && !self.columns.iter().any(|c| c.is_primary_key) {
            return Err("a new target needs at least one primary key column".to_string());
        }

        self.options.delimiter_byte()?;
        Ok(())
    }
}

/// Everything the engine needs to run one export.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobRequest {
    pub source: String,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    pub format: FileFormat,
    #[serde(default)]
    pub options: FormatOptions,
}
