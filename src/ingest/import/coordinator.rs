//! Import coordination.
//!
//! The ImportEngine drives one job end to end:
//! 1. Validate the request and detect the input format
//! 2. Prepare the target (create, record metadata, truncate on replace)
//! 3. Load existing keys for duplicate detection
//! 4. Parse, type and classify rows, submitting full batches as they fill
//! 5. Drain in-flight batches and flush the final partial batch

use crate::config::{DuplicateStrategy, LoaderConfig};
use crate::ingest::duplicates::{Classification, DuplicateResolver, ExistingRows};
use crate::ingest::errors::{ErrorAggregator, ImportFailure};
use crate::ingest::import::batch::{BatchAccumulator, BatchScheduler};
use crate::ingest::import::stats::{ImportProgress, ImportResult};
use crate::ingest::parser::{RecordReader, RowBuilder};
use crate::schema::{
    FileFormat, ImportJobRequest, ImportMode, LAST_MODIFIED_AT, LAST_MODIFIED_BY, Row, RowLayout,
};
use crate::store::{SchemaCatalog, TargetStore};
use crate::value::Value;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Rows between two progress snapshots.
const PROGRESS_INTERVAL: u64 = 500;

#[derive(Clone)]
pub struct ImportEngine {
    store: Arc<dyn TargetStore>,
    catalog: Arc<dyn SchemaCatalog>,
    config: LoaderConfig,
}

impl ImportEngine {
    pub fn new(
        store: Arc<dyn TargetStore>,
        catalog: Arc<dyn SchemaCatalog>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Import one stream into the request's target.
    ///
    /// `Err` is returned only when the job cannot start. Once rows are
    /// flowing, a fatal problem is reported in [`ImportResult::failure`]
    /// together with the counts of everything committed before it.
    pub async fn run_import<R>(
        &self,
        input: R,
        file_name: Option<&str>,
        content_type: Option<&str>,
        request: &ImportJobRequest,
        cancel: &CancellationToken,
    ) -> Result<ImportResult, ImportFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.run_import_with_progress(input, file_name, content_type, request, cancel, None)
            .await
    }

    /// Same as [`run_import`](Self::run_import), publishing progress snapshots.
    pub async fn run_import_with_progress<R>(
        &self,
        input: R,
        file_name: Option<&str>,
        content_type: Option<&str>,
        request: &ImportJobRequest,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<ImportProgress>>,
    ) -> Result<ImportResult, ImportFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        request.validate().map_err(ImportFailure::InvalidRequest)?;

        let format = FileFormat::detect(content_type, file_name).ok_or_else(|| {
            ImportFailure::UnsupportedFormat(format!(
                "content type {:?}, file name {:?}",
                content_type.unwrap_or("none"),
                file_name.unwrap_or("none")
            ))
        })?;

        if cancel.is_cancelled() {
            return Err(ImportFailure::Cancelled);
        }

        log::info!(
            "starting {:?} import into {} ({:?}, {} columns)",
            request.mode,
            request.target,
            format,
            request.columns.len()
        );

        let layout = RowLayout::new(request.columns.clone());
        let created = self.prepare_target(request).await?;
        let mut resolver = self.build_resolver(request, &layout, created).await?;

        let mut reader = RecordReader::open(format, input, &request.options)?;
        let builder = RowBuilder::new(layout.clone(), request.actor.clone());
        let mut accumulator = BatchAccumulator::new(self.config.batch_size);
        let mut scheduler = BatchScheduler::new(
            self.store.clone(),
            &request.target,
            layout.clone(),
            self.config.max_parallel_batches,
        );
        let mut errors = ErrorAggregator::new();
        let mut duplicates: Vec<Row> = Vec::new();
        let mut rows_read = 0u64;
        let mut fatal: Option<ImportFailure> = None;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            scheduler.reap();
            if scheduler.has_failed() {
                break;
            }

            let record = match reader.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            };
            rows_read += 1;

            match builder.build(&record) {
                Ok(row) => match resolver.classify(&row) {
                    Classification::Insert => {
                        if let Some(batch) = accumulator.push(row) {
                            if cancel.is_cancelled() {
                                cancelled = true;
                                break;
                            }
                            scheduler.submit(batch).await;
                        }
                    }
                    Classification::Duplicate => duplicates.push(row),
                },
                Err(row_errors) => errors.record_row(row_errors),
            }

            if rows_read % PROGRESS_INTERVAL == 0 {
                publish(progress, || ImportProgress {
                    rows_read,
                    rows_inserted: scheduler.stats().rows_inserted,
                    rows_skipped: duplicates.len() as u64,
                    error_count: errors.len() as u64,
                    batches_committed: scheduler.stats().batches_committed,
                });
            }
        }

        if cancelled || fatal.is_some() || scheduler.has_failed() {
            let dropped = accumulator.discard();
            if dropped > 0 {
                log::warn!("discarding {} rows of an unflushed batch", dropped);
            }
            scheduler.drain().await;
        } else {
            scheduler.drain().await;
            if !scheduler.has_failed() {
                if let Some(batch) = accumulator.take_remaining() {
                    scheduler.commit_now(batch).await;
                }
            }
        }

        let failure = fatal.or_else(|| scheduler.take_failure());
        if cancelled {
            log::warn!("import into {} cancelled after {} rows", request.target, rows_read);
        }
        if let Some(failure) = &failure {
            log::error!("import into {} failed: {}", request.target, failure);
        }
        if !errors.is_empty() {
            log::warn!(
                "{} rows of {} rejected with {} errors",
                errors.failed_rows(),
                request.target,
                errors.len()
            );
        }

        let stats = scheduler.stats().clone();
        let rows_skipped = duplicates.len() as u64;
        let failed_rows = errors.failed_rows();
        let error_count = errors.len() as u64;

        publish(progress, || ImportProgress {
            rows_read,
            rows_inserted: stats.rows_inserted,
            rows_skipped,
            error_count,
            batches_committed: stats.batches_committed,
        });

        let result = ImportResult {
            rows_processed: stats.rows_inserted + rows_skipped + failed_rows,
            rows_inserted: stats.rows_inserted,
            rows_updated: 0,
            rows_skipped,
            error_count,
            errors: errors.into_errors(),
            duplicated_rows: duplicates,
            success: failure.is_none() && !cancelled && error_count == 0,
            cancelled,
            failure: failure
                .map(|f| f.to_string())
                .or_else(|| cancelled.then(|| ImportFailure::Cancelled.to_string())),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        log::info!(
            "import into {} finished: {} inserted, {} duplicates, {} errors in {}ms",
            request.target,
            result.rows_inserted,
            result.rows_skipped,
            result.error_count,
            result.elapsed_ms
        );

        Ok(result)
    }

    /// Replace stored rows matching the given duplicates, in one transaction.
    pub async fn apply_duplicates(
        &self,
        request: &ImportJobRequest,
        rows: &[BTreeMap<String, Value>],
    ) -> Result<ImportResult, ImportFailure> {
        let started = Instant::now();
        request.validate().map_err(ImportFailure::InvalidRequest)?;

        if !self.catalog.target_exists(&request.target).await? {
            return Err(ImportFailure::InvalidRequest(format!(
                "target '{}' does not exist",
                request.target
            )));
        }

        let layout = RowLayout::new(request.columns.clone());
        if !layout.has_search_columns() {
            return Err(ImportFailure::InvalidRequest(
                "no column participates in the duplicate key".to_string(),
            ));
        }

        let now = Utc::now();
        let stamped: Vec<Row> = rows
            .iter()
            .map(|named| {
                let mut named = named.clone();
                named.insert(LAST_MODIFIED_AT.to_string(), Value::Timestamp(now));
                named.insert(LAST_MODIFIED_BY.to_string(), Value::Text(request.actor.clone()));
                Row::from_named(layout.clone(), &named)
            })
            .collect();

        let updated = self
            .store
            .replace_duplicates(&request.target, &layout, &stamped)
            .await
            .map_err(|err| ImportFailure::storage("duplicate replacement", err))?;

        log::info!("replaced {} duplicate rows in {}", updated, request.target);

        Ok(ImportResult {
            rows_processed: stamped.len() as u64,
            rows_updated: updated,
            success: true,
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..ImportResult::default()
        })
    }

    /// Returns `true` when the target was created by this call.
    async fn prepare_target(&self, request: &ImportJobRequest) -> Result<bool, ImportFailure> {
        let mut created = false;

        if !self.catalog.target_exists(&request.target).await? {
            if !request.is_new_target {
                return Err(ImportFailure::InvalidRequest(format!(
                    "target '{}' does not exist",
                    request.target
                )));
            }
            self.catalog
                .create_target(&request.target, &request.columns)
                .await?;
            self.catalog
                .save_column_metadata(&request.target, &request.columns)
                .await?;
            created = true;
        }

        if request.mode == ImportMode::Replace && !created {
            self.store
                .truncate(&request.target)
                .await
                .map_err(|err| ImportFailure::storage("truncate", err))?;
        }

        Ok(created)
    }

    async fn build_resolver(
        &self,
        request: &ImportJobRequest,
        layout: &Arc<RowLayout>,
        created: bool,
    ) -> Result<DuplicateResolver, ImportFailure> {
        if request.mode == ImportMode::Replace || !layout.has_search_columns() {
            return Ok(DuplicateResolver::disabled());
        }
        if created {
            return Ok(DuplicateResolver::new(layout, ExistingRows::Keys(Vec::new())));
        }

        let existing = match self.config.duplicate_strategy {
            DuplicateStrategy::Keys => {
                let key_columns: Vec<_> = layout.search_columns().into_iter().cloned().collect();
                ExistingRows::Keys(
                    self.store
                        .existing_keys(&request.target, &key_columns)
                        .await
                        .map_err(|err| ImportFailure::storage("duplicate key lookup", err))?,
                )
            }
            DuplicateStrategy::Snapshot => ExistingRows::Snapshot(
                self.store
                    .existing_rows(&request.target, layout.user_columns())
                    .await
                    .map_err(|err| ImportFailure::storage("snapshot lookup", err))?,
            ),
        };

        let resolver = DuplicateResolver::new(layout, existing);
        log::debug!(
            "loaded {} existing keys from {}",
            resolver.known_keys(),
            request.target
        );
        Ok(resolver)
    }
}

fn publish(progress: Option<&watch::Sender<ImportProgress>>, snapshot: impl FnOnce() -> ImportProgress) {
    if let Some(sender) = progress {
        sender.send_replace(snapshot());
    }
}
