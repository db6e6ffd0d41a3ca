//! Output side: resolve an export request against the catalog, stream rows
//! from the store and serialize them into an async sink.

pub mod serializer;

pub use serializer::{RowSerializer, sanitize_element_name};

use crate::schema::{ExportJobRequest, LAST_MODIFIED_AT, LAST_MODIFIED_BY, WireType};
use crate::store::{
    CatalogError, ExportColumn, ExportQuery, SchemaCatalog, StorageError, TargetStore,
};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("delimited writer error: {0}")]
    Csv(#[from] csv_async::Error),
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("export cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub rows_exported: u64,
    pub bytes_written: u64,
    pub elapsed_ms: u64,
}

/// Sink wrapper counting the bytes actually accepted by the inner writer.
pub struct CountingWriter<W> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handle to the running byte count.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.written.clone()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Clone)]
pub struct ExportEngine {
    store: Arc<dyn TargetStore>,
    catalog: Arc<dyn SchemaCatalog>,
}

impl ExportEngine {
    pub fn new(store: Arc<dyn TargetStore>, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Resolve the requested projection against the live catalog.
    ///
    /// Without a projection every column is exported, synthetic ones last.
    pub async fn resolve_columns(
        &self,
        request: &ExportJobRequest,
    ) -> Result<Vec<ExportColumn>, ExportError> {
        if !self.catalog.target_exists(&request.source).await? {
            return Err(CatalogError::UnknownTarget(request.source.clone()).into());
        }

        let mut available: Vec<ExportColumn> = self
            .catalog
            .get_columns(&request.source)
            .await?
            .into_iter()
            .map(|c| ExportColumn {
                wire_type: WireType::from(c.column_type),
                name: c.name,
            })
            .collect();
        available.push(ExportColumn {
            name: LAST_MODIFIED_AT.to_string(),
            wire_type: WireType::TimestampTz,
        });
        available.push(ExportColumn {
            name: LAST_MODIFIED_BY.to_string(),
            wire_type: WireType::Text,
        });

        let requested = match request.columns.as_deref() {
            Some(names) if !names.is_empty() => names,
            _ => return Ok(available),
        };

        requested
            .iter()
            .map(|name| {
                available
                    .iter()
                    .find(|c| c.name == *name)
                    .cloned()
                    .ok_or_else(|| {
                        ExportError::from(CatalogError::UnknownColumn {
                            target: request.source.clone(),
                            column: name.clone(),
                        })
                    })
            })
            .collect()
    }

    /// Export the rows selected by `request` into `sink`.
    pub async fn run_export<W>(
        &self,
        request: &ExportJobRequest,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<ExportResult, ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        if request.source.trim().is_empty() {
            return Err(ExportError::InvalidRequest("source name is empty".to_string()));
        }

        let columns = self.resolve_columns(request).await?;
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        log::info!(
            "starting {:?} export of {} ({} columns)",
            request.format,
            request.source,
            columns.len()
        );

        let counting = CountingWriter::new(sink);
        let bytes = counting.counter();
        let mut serializer = RowSerializer::new(request.format, counting, &names, &request.options)?;

        let mut rows = self
            .store
            .stream_rows(ExportQuery {
                source: request.source.clone(),
                columns,
                filter: request.filter.clone(),
                limit: request.limit,
            })
            .await?;

        serializer.begin().await?;
        let mut rows_exported = 0u64;
        while let Some(row) = rows.recv().await {
            if cancel.is_cancelled() {
                log::warn!("export of {} cancelled after {} rows", request.source, rows_exported);
                return Err(ExportError::Cancelled);
            }
            serializer.write_row(&row?).await?;
            rows_exported += 1;
        }
        serializer.finish().await?;

        let result = ExportResult {
            rows_exported,
            bytes_written: bytes.load(Ordering::Relaxed),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        log::info!(
            "export of {} finished: {} rows, {} bytes in {}ms",
            request.source,
            result.rows_exported,
            result.bytes_written,
            result.elapsed_ms
        );
        Ok(result)
    }
}
