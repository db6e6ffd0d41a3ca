//! Request and response bodies of the HTTP API.

use crate::ingest::{ImportError, ImportResult};
use crate::schema::ImportJobRequest;
use crate::value::Value;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A row keyed by column name.
pub type NamedRow = BTreeMap<String, Value>;

/// Outcome of an import or duplicate replacement job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub job_id: String,
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped: u64,
    pub error_count: u64,
    pub errors: Vec<ImportError>,
    /// Rows held back because their key already exists, for review.
    pub duplicated_rows: Vec<NamedRow>,
    pub success: bool,
    pub cancelled: bool,
    pub failure: Option<String>,
    pub elapsed_ms: u64,
}

impl ImportResponse {
    pub fn new(job_id: Uuid, result: ImportResult) -> Self {
        Self {
            job_id: job_id.to_string(),
            rows_processed: result.rows_processed,
            rows_inserted: result.rows_inserted,
            rows_updated: result.rows_updated,
            rows_skipped: result.rows_skipped,
            error_count: result.error_count,
            errors: result.errors,
            duplicated_rows: result.duplicated_rows.iter().map(|row| row.to_named()).collect(),
            success: result.success,
            cancelled: result.cancelled,
            failure: result.failure,
            elapsed_ms: result.elapsed_ms,
        }
    }
}

/// Previously reported duplicates the caller wants written over the stored rows.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDuplicatesRequest {
    pub request: ImportJobRequest,
    pub rows: Vec<NamedRow>,
}
