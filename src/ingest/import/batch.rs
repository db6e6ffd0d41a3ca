//! Fixed-size batching and bounded-parallel batch loading.
//!
//! Parsing never waits on a database round trip unless every worker permit
//! is taken. Completed loads are reaped between rows; a failed load is kept
//! and reported, and the caller stops submitting.

use crate::ingest::errors::ImportFailure;
use crate::ingest::import::stats::ImportStats;
use crate::schema::{Row, RowLayout};
use crate::store::{StorageError, TargetStore};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Rows committed together in one transaction. Numbers start at 1.
#[derive(Debug)]
pub struct Batch {
    pub number: u64,
    pub rows: Vec<Row>,
}

/// Collects accepted rows and hands out full batches.
pub struct BatchAccumulator {
    size: usize,
    next_number: u64,
    rows: Vec<Row>,
}

impl BatchAccumulator {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            next_number: 1,
            rows: Vec::with_capacity(size),
        }
    }

    /// Add a row; returns the batch once it is full.
    pub fn push(&mut self, row: Row) -> Option<Batch> {
        self.rows.push(row);
        if self.rows.len() >= self.size {
            self.take()
        } else {
            None
        }
    }

    /// The final, possibly partial, batch.
    pub fn take_remaining(&mut self) -> Option<Batch> {
        self.take()
    }

    pub fn pending(&self) -> usize {
        self.rows.len()
    }

    /// Drop rows that will never be written. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.rows.len();
        self.rows.clear();
        dropped
    }

    fn take(&mut self) -> Option<Batch> {
        if self.rows.is_empty() {
            return None;
        }
        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.size));
        let number = self.next_number;
        self.next_number += 1;
        Some(Batch { number, rows })
    }
}

struct BatchOutcome {
    number: u64,
    rows: usize,
    result: Result<u64, StorageError>,
}

/// Runs batch loads on tokio tasks, at most `max_parallel` at a time.
pub struct BatchScheduler {
    store: Arc<dyn TargetStore>,
    target: Arc<str>,
    layout: Arc<RowLayout>,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<BatchOutcome>,
    stats: ImportStats,
    failure: Option<ImportFailure>,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn TargetStore>,
        target: &str,
        layout: Arc<RowLayout>,
        max_parallel: usize,
    ) -> Self {
        Self {
            store,
            target: Arc::from(target),
            layout,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            in_flight: JoinSet::new(),
            stats: ImportStats::default(),
            failure: None,
        }
    }

    pub fn stats(&self) -> &ImportStats {
        &self.stats
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn take_failure(&mut self) -> Option<ImportFailure> {
        self.failure.take()
    }

    /// Spawn a load for `batch`, waiting for a free worker first.
    pub async fn submit(&mut self, batch: Batch) {
        self.reap();

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                self.fail(batch.number, StorageError::Backend(err.to_string()));
                return;
            }
        };

        let store = self.store.clone();
        let target = self.target.clone();
        let layout = self.layout.clone();
        log::debug!("submitting batch {} ({} rows)", batch.number, batch.rows.len());

        self.in_flight.spawn(async move {
            let _permit = permit;
            let result = store.load_batch(&target, &layout, &batch.rows).await;
            BatchOutcome {
                number: batch.number,
                rows: batch.rows.len(),
                result,
            }
        });
    }

    /// Load `batch` on the current task.
    pub async fn commit_now(&mut self, batch: Batch) {
        let result = self
            .store
            .load_batch(&self.target, &self.layout, &batch.rows)
            .await;
        self.absorb(Ok(BatchOutcome {
            number: batch.number,
            rows: batch.rows.len(),
            result,
        }));
    }

    /// Collect every load that has already finished.
    pub fn reap(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            self.absorb(joined);
        }
    }

    /// Wait for every in-flight load.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.absorb(joined);
        }
    }

    fn absorb(&mut self, joined: Result<BatchOutcome, JoinError>) {
        match joined {
            Ok(BatchOutcome {
                number,
                rows,
                result: Ok(written),
            }) => {
                log::debug!("batch {} committed ({} of {} rows)", number, written, rows);
                self.stats.record_batch(written);
            }
            Ok(BatchOutcome {
                number,
                result: Err(err),
                ..
            }) => self.fail(number, err),
            Err(err) => {
                // the task panicked, so its batch number is gone
                log::error!("batch task failed: {}", err);
                if self.failure.is_none() {
                    self.failure = Some(ImportFailure::storage(
                        "batch load",
                        StorageError::Backend(err.to_string()),
                    ));
                }
            }
        }
    }

    fn fail(&mut self, number: u64, err: StorageError) {
        log::error!("batch {} rolled back: {}", number, err);
        if self.failure.is_none() {
            self.failure = Some(ImportFailure::storage(format!("batch {}", number), err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};
    use crate::value::Value;

    fn rows(n: usize) -> Vec<Row> {
        let layout = RowLayout::new(vec![ColumnSchema::new("id", ColumnType::Integer)]);
        (0..n)
            .map(|i| Row::new(layout.clone(), vec![Value::Int(i as i64), Value::Null, Value::Null]))
            .collect()
    }

    #[test]
    fn test_accumulator_emits_full_batches_in_order() {
        let mut acc = BatchAccumulator::new(2);
        let mut emitted = Vec::new();
        for row in rows(5) {
            if let Some(batch) = acc.push(row) {
                emitted.push((batch.number, batch.rows.len()));
            }
        }
        assert_eq!(emitted, vec![(1, 2), (2, 2)]);
        assert_eq!(acc.pending(), 1);

        let last = acc.take_remaining().unwrap();
        assert_eq!((last.number, last.rows.len()), (3, 1));
        assert!(acc.take_remaining().is_none());
    }

    #[test]
    fn test_discard_drops_pending_rows() {
        let mut acc = BatchAccumulator::new(10);
        for row in rows(3) {
            assert!(acc.push(row).is_none());
        }
        assert_eq!(acc.discard(), 3);
        assert!(acc.take_remaining().is_none());
    }
}
