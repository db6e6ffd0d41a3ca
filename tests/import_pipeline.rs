use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use table_loader::config::{DuplicateStrategy, LoaderConfig};
use table_loader::export::ExportEngine;
use table_loader::ingest::{ImportEngine, ImportFailure};
use table_loader::schema::{
    ColumnSchema, ColumnType, ExportJobRequest, FileFormat, FormatOptions, ImportJobRequest,
    ImportMode,
};
use table_loader::test_support::MemoryBackend;
use table_loader::value::Value;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

fn columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::new("id", ColumnType::Integer)
            .primary_key()
            .duplicate_key(),
        ColumnSchema::new("name", ColumnType::Text),
        ColumnSchema::new("score", ColumnType::Double),
    ]
}

fn request(mode: ImportMode, is_new_target: bool) -> ImportJobRequest {
    ImportJobRequest {
        target: "people".to_string(),
        columns: columns(),
        options: FormatOptions::default(),
        mode,
        is_new_target,
        actor: "tester".to_string(),
    }
}

fn people_csv(ids: impl IntoIterator<Item = i64>) -> String {
    let mut csv = String::from("id,name,score\n");
    for id in ids {
        csv.push_str(&format!("{id},person {id},{id}.5\n"));
    }
    csv
}

fn engine(backend: &MemoryBackend, config: LoaderConfig) -> ImportEngine {
    ImportEngine::new(backend.store(), backend.catalog(), config)
}

fn config() -> LoaderConfig {
    LoaderConfig {
        batch_size: 1_000,
        max_parallel_batches: 4,
        ..LoaderConfig::default()
    }
}

fn stored_ids(rows: &[BTreeMap<String, Value>]) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .iter()
        .filter_map(|row| match row.get("id") {
            Some(Value::Int(id)) => Some(*id),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    ids
}

/// Hands out one line per read and trips a token after a given line.
struct LineFeed {
    lines: VecDeque<Vec<u8>>,
    delivered: usize,
    cancel_after: usize,
    token: CancellationToken,
}

impl LineFeed {
    fn new(text: &str, cancel_after: usize, token: CancellationToken) -> Self {
        Self {
            lines: text.split_inclusive('\n').map(|l| l.as_bytes().to_vec()).collect(),
            delivered: 0,
            cancel_after,
            token,
        }
    }
}

impl AsyncRead for LineFeed {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(line) = self.lines.pop_front() {
            let n = line.len().min(buf.remaining());
            buf.put_slice(&line[..n]);
            if n < line.len() {
                self.lines.push_front(line[n..].to_vec());
            } else {
                self.delivered += 1;
                if self.delivered == self.cancel_after {
                    self.token.cancel();
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn rows_are_committed_in_fixed_size_batches() {
    let backend = MemoryBackend::new();
    let csv = people_csv(1..=2_500);

    let result = engine(&backend, config())
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, true),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");

    assert!(result.success, "unexpected failure: {:?}", result.failure);
    assert_eq!(result.rows_inserted, 2_500);
    assert_eq!(result.rows_processed, 2_500);
    assert_eq!(backend.committed_batches().await, vec![1_000, 1_000, 500]);
    assert_eq!(backend.row_count("people").await, 2_500);
    assert!(backend.has_metadata("people").await);

    let stored = backend.rows("people").await;
    let first = stored
        .iter()
        .find(|row| row.get("id") == Some(&Value::Int(1)))
        .expect("row 1 stored");
    assert_eq!(first.get("score"), Some(&Value::Float(1.5)));
    assert_eq!(
        first.get("last_modified_by"),
        Some(&Value::Text("tester".to_string()))
    );
    assert!(matches!(first.get("last_modified_at"), Some(Value::Timestamp(_))));
}

#[tokio::test]
async fn failed_batch_stops_job_and_keeps_committed_rows() {
    let backend = MemoryBackend::new();
    backend.fail_batches_containing(Value::Int(1_500)).await;
    let csv = people_csv(1..=2_500);

    let result = engine(&backend, config())
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, true),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");

    assert!(!result.success);
    assert!(
        result
            .failure
            .as_deref()
            .is_some_and(|msg| msg.contains("forced failure")),
        "failure was {:?}",
        result.failure
    );
    assert_eq!(result.rows_inserted, 1_000);
    assert_eq!(backend.row_count("people").await, 1_000);
    assert_eq!(stored_ids(&backend.rows("people").await), (1..=1_000).collect::<Vec<_>>());
}

#[tokio::test]
async fn cancellation_keeps_committed_batches_only() {
    let backend = MemoryBackend::new();
    let token = CancellationToken::new();
    let csv = people_csv(1..=2_500);
    // header plus 1,200 data lines
    let input = LineFeed::new(&csv, 1_201, token.clone());

    let result = engine(&backend, config())
        .run_import(
            input,
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, true),
            &token,
        )
        .await
        .expect("import runs");

    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.rows_processed, 1_000);
    assert_eq!(result.rows_inserted, 1_000);
    assert_eq!(backend.row_count("people").await, 1_000);
}

#[tokio::test]
async fn already_cancelled_job_does_not_start() {
    let backend = MemoryBackend::new();
    let token = CancellationToken::new();
    token.cancel();

    let outcome = engine(&backend, config())
        .run_import(
            people_csv(1..=3).as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, true),
            &token,
        )
        .await;

    assert!(matches!(outcome, Err(ImportFailure::Cancelled)));
    assert!(backend.committed_batches().await.is_empty());
}

async fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.create_table("people", columns()).await;
    let seed = [1i64, 2]
        .into_iter()
        .map(|id| {
            BTreeMap::from([
                ("id".to_string(), Value::Int(id)),
                ("name".to_string(), Value::Text(format!("stored {id}"))),
                ("score".to_string(), Value::Float(0.5)),
            ])
        })
        .collect();
    backend.seed_rows("people", seed).await;
    backend
}

async fn assert_duplicates_detected(strategy: DuplicateStrategy) {
    let backend = seeded_backend().await;
    let config = LoaderConfig {
        duplicate_strategy: strategy,
        ..config()
    };
    let csv = "id,name,score\n1,new 1,1.5\n2,new 2,2.5\n3,new 3,3.5\n3,again 3,3.5\n";

    let result = engine(&backend, config)
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, false),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");

    assert!(result.success);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.rows_skipped, 3);
    assert_eq!(result.rows_processed, 4);

    let duplicate_ids: Vec<Value> = result
        .duplicated_rows
        .iter()
        .filter_map(|row| row.get("id").cloned())
        .collect();
    assert_eq!(duplicate_ids, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(stored_ids(&backend.rows("people").await), vec![1, 2, 3]);
}

#[tokio::test]
async fn duplicates_on_key_column_are_held_back() {
    assert_duplicates_detected(DuplicateStrategy::Keys).await;
}

#[tokio::test]
async fn snapshot_lookup_detects_the_same_duplicates() {
    assert_duplicates_detected(DuplicateStrategy::Snapshot).await;
}

#[tokio::test]
async fn applying_duplicates_overwrites_stored_rows() {
    let backend = seeded_backend().await;
    let engine = engine(&backend, config());
    let csv = "id,name,score\n1,renamed 1,9.5\n";

    let first = engine
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, false),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");
    assert_eq!(first.rows_skipped, 1);

    let named: Vec<BTreeMap<String, Value>> =
        first.duplicated_rows.iter().map(|row| row.to_named()).collect();
    let mut apply = request(ImportMode::Insert, false);
    apply.actor = "reviewer".to_string();

    let applied = engine
        .apply_duplicates(&apply, &named)
        .await
        .expect("duplicates applied");
    assert_eq!(applied.rows_updated, 1);

    let stored = backend.rows("people").await;
    assert_eq!(stored.len(), 2);
    let renamed = stored
        .iter()
        .find(|row| row.get("id") == Some(&Value::Int(1)))
        .expect("row 1 present");
    assert_eq!(renamed.get("name"), Some(&Value::Text("renamed 1".to_string())));
    assert_eq!(
        renamed.get("last_modified_by"),
        Some(&Value::Text("reviewer".to_string()))
    );
}

#[tokio::test]
async fn replace_mode_is_idempotent() {
    let backend = seeded_backend().await;
    let engine = engine(&backend, config());
    let csv = people_csv(10..=14);

    for _ in 0..2 {
        let result = engine
            .run_import(
                csv.as_bytes(),
                Some("people.csv"),
                None,
                &request(ImportMode::Replace, false),
                &CancellationToken::new(),
            )
            .await
            .expect("import runs");
        assert!(result.success);
        assert_eq!(result.rows_inserted, 5);
        assert_eq!(stored_ids(&backend.rows("people").await), vec![10, 11, 12, 13, 14]);
    }
}

#[tokio::test]
async fn bad_rows_are_reported_and_skipped() {
    let backend = MemoryBackend::new();
    let mut job = request(ImportMode::Insert, true);
    job.columns[1] = ColumnSchema::new("name", ColumnType::Text).required();
    let csv = "id,name,score\n1,ok,1.5\nx,bad id,2.5\n3,,3.5\n4,ok,12,5\n";

    let result = engine(&backend, config())
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &job,
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");

    assert!(!result.success);
    assert!(result.failure.is_none());
    assert_eq!(result.rows_inserted, 2);
    assert_eq!(result.error_count, 2);
    assert_eq!(result.rows_processed, 4);

    assert_eq!(result.errors[0].row_number, 2);
    assert_eq!(result.errors[0].column.as_deref(), Some("id"));
    assert_eq!(result.errors[0].original_value.as_deref(), Some("x"));
    assert_eq!(result.errors[1].row_number, 3);
    assert_eq!(result.errors[1].column.as_deref(), Some("name"));
    assert_eq!(stored_ids(&backend.rows("people").await), vec![1, 4]);
}

#[tokio::test]
async fn blank_primary_key_is_rejected_per_row() {
    let backend = MemoryBackend::new();
    let mut job = request(ImportMode::Insert, true);
    job.columns[0] =
        serde_json::from_str(r#"{"name": "id", "type": "integer", "isPrimaryKey": true}"#)
            .expect("column schema");
    let csv = "id,name,score\n,Ann,1.5\n2,Bob,2.5\n";

    let result = engine(&backend, config())
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &job,
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");

    assert!(result.failure.is_none());
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.errors[0].row_number, 1);
    assert_eq!(result.errors[0].column.as_deref(), Some("id"));
    assert_eq!(stored_ids(&backend.rows("people").await), vec![2]);
}

#[tokio::test]
async fn unknown_target_without_creation_is_rejected() {
    let backend = MemoryBackend::new();

    let outcome = engine(&backend, config())
        .run_import(
            people_csv(1..=2).as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, false),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(outcome, Err(ImportFailure::InvalidRequest(_))));
}

#[tokio::test]
async fn unsupported_format_is_rejected_before_reading() {
    let backend = MemoryBackend::new();

    let outcome = engine(&backend, config())
        .run_import(
            &b"{}"[..],
            Some("people.json"),
            Some("application/json"),
            &request(ImportMode::Insert, true),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(outcome, Err(ImportFailure::UnsupportedFormat(_))));
    assert!(!backend.has_metadata("people").await);
}

#[tokio::test]
async fn markup_input_is_loaded() {
    let backend = MemoryBackend::new();
    let xml = r#"<?xml version="1.0"?>
<people>
  <person><id>1</id><name>Ann</name><score>1.5</score></person>
  <person><id>2</id><name/><score>2.5</score></person>
  <person><id>3</id><name>Cy</name></person>
</people>"#;

    let result = engine(&backend, config())
        .run_import(
            xml.as_bytes(),
            None,
            Some("application/xml"),
            &request(ImportMode::Insert, true),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");

    assert!(result.success, "unexpected failure: {:?}", result.failure);
    assert_eq!(result.rows_inserted, 3);
    let stored = backend.rows("people").await;
    let find = |id: i64| {
        stored
            .iter()
            .find(|row| row.get("id") == Some(&Value::Int(id)))
            .unwrap_or_else(|| panic!("row {id} stored"))
    };
    assert_eq!(find(2).get("name"), Some(&Value::Null));
    assert_eq!(find(2).get("score"), Some(&Value::Float(2.5)));
    assert_eq!(find(3).get("name"), Some(&Value::Text("Cy".to_string())));
    assert_eq!(find(3).get("score"), Some(&Value::Null));
}

fn user_values(rows: &[BTreeMap<String, Value>]) -> Vec<Vec<Value>> {
    let mut values: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            ["id", "name", "score"]
                .iter()
                .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    values.sort_by_key(|row| match row[0] {
        Value::Int(id) => id,
        _ => i64::MAX,
    });
    values
}

#[tokio::test]
async fn markup_round_trip_keeps_nulls_in_place() {
    let backend = MemoryBackend::new();
    let csv = "id,name,score\n1,Ann,1.5\n2,,2.5\n3,Cy,\n";
    let imported = engine(&backend, config())
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, true),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");
    assert!(imported.success);

    let mut xml = Vec::new();
    ExportEngine::new(backend.store(), backend.catalog())
        .run_export(
            &ExportJobRequest {
                source: "people".to_string(),
                columns: Some(vec!["id".to_string(), "name".to_string(), "score".to_string()]),
                filter: None,
                limit: None,
                format: FileFormat::Markup,
                options: FormatOptions::default(),
            },
            &mut xml,
            &CancellationToken::new(),
        )
        .await
        .expect("export runs");

    let copy = ImportJobRequest {
        target: "people_copy".to_string(),
        ..request(ImportMode::Insert, true)
    };
    let reloaded = engine(&backend, config())
        .run_import(
            &xml[..],
            Some("people.xml"),
            None,
            &copy,
            &CancellationToken::new(),
        )
        .await
        .expect("reimport runs");
    assert!(reloaded.success, "unexpected failure: {:?}", reloaded.failure);
    assert_eq!(reloaded.rows_inserted, 3);

    assert_eq!(
        user_values(&backend.rows("people_copy").await),
        user_values(&backend.rows("people").await)
    );
    assert_eq!(
        user_values(&backend.rows("people_copy").await)[1],
        vec![Value::Int(2), Value::Null, Value::Float(2.5)]
    );
}

#[tokio::test]
async fn delimited_round_trip_preserves_content() {
    let backend = MemoryBackend::new();
    let csv = people_csv(1..=25);

    let result = engine(&backend, config())
        .run_import(
            csv.as_bytes(),
            Some("people.csv"),
            None,
            &request(ImportMode::Insert, true),
            &CancellationToken::new(),
        )
        .await
        .expect("import runs");
    assert!(result.success);

    let export = ExportEngine::new(backend.store(), backend.catalog());
    let mut output = Vec::new();
    let exported = export
        .run_export(
            &ExportJobRequest {
                source: "people".to_string(),
                columns: Some(vec!["id".to_string(), "name".to_string(), "score".to_string()]),
                filter: None,
                limit: None,
                format: FileFormat::Delimited,
                options: FormatOptions::default(),
            },
            &mut output,
            &CancellationToken::new(),
        )
        .await
        .expect("export runs");

    assert_eq!(exported.rows_exported, 25);
    assert_eq!(exported.bytes_written, output.len() as u64);
    assert_eq!(String::from_utf8(output).unwrap(), csv);
}
