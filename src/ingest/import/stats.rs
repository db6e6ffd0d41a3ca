//! Import counters, progress snapshots and the final job result.

use crate::ingest::errors::ImportError;
use crate::schema::Row;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Committed-batch counters, updated as batches finish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportStats {
    pub batches_committed: u64,
    pub rows_inserted: u64,
}

impl ImportStats {
    pub fn record_batch(&mut self, rows: u64) {
        self.batches_committed += 1;
        self.rows_inserted += rows;
    }
}

/// Point-in-time view of a running import, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub error_count: u64,
    pub batches_committed: u64,
}

/// Outcome of one import job.
///
/// `rows_processed` counts rows whose fate is final: committed, classified as
/// duplicate, or rejected with errors. Rows still waiting in an unflushed
/// batch when a job is cancelled or fails are not counted.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped: u64,
    pub error_count: u64,
    pub errors: Vec<ImportError>,
    pub duplicated_rows: Vec<Row>,
    pub success: bool,
    pub cancelled: bool,
    pub failure: Option<String>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch() {
        let mut stats = ImportStats::default();
        stats.record_batch(1000);
        stats.record_batch(500);
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.rows_inserted, 1500);
    }

    #[test]
    fn test_progress_serializes_camel_case() {
        let json = serde_json::to_value(ImportProgress {
            rows_read: 3,
            ..ImportProgress::default()
        })
        .unwrap();
        assert_eq!(json["rowsRead"], 3);
        assert_eq!(json["batchesCommitted"], 0);
    }
}
