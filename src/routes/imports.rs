//! Import endpoints: streamed file upload and duplicate replacement.

use crate::error::ApiError;
use crate::ingest::{ImportEngine, ImportFailure, ImportResult};
use crate::jobs::{JobKind, JobRegistry, JobStatus};
use crate::models::{ApplyDuplicatesRequest, ImportResponse};
use crate::routes::helpers::finish_job;
use crate::schema::ImportJobRequest;
use rocket::State;
use rocket::data::{Data, ToByteUnit};
use rocket::http::ContentType;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket_okapi::openapi;
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Header carrying the JSON-encoded [`ImportJobRequest`] of an upload.
pub const IMPORT_REQUEST_HEADER: &str = "X-Import-Request";

/// Import descriptor read from [`IMPORT_REQUEST_HEADER`].
///
/// Parse problems are kept so the handler can answer with a JSON error.
pub struct ImportRequestHeader(Result<ImportJobRequest, String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ImportRequestHeader {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let parsed = match request.headers().get_one(IMPORT_REQUEST_HEADER) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| format!("malformed {IMPORT_REQUEST_HEADER} header: {err}")),
            None => Err(format!("missing {IMPORT_REQUEST_HEADER} header")),
        };
        Outcome::Success(ImportRequestHeader(parsed))
    }
}

/// Upload body that fails with a read error once more than `limit` bytes
/// arrive. The data stream is opened one byte past the limit so an oversized
/// body is told apart from one of exactly `limit` bytes.
struct LimitedUpload<R> {
    inner: R,
    limit: u64,
    read: u64,
}

impl<R> LimitedUpload<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedUpload<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.read += (buf.filled().len() - before) as u64;

        if self.read > self.limit {
            buf.set_filled(before);
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("upload exceeds the limit of {} bytes", self.limit),
            )));
        }
        Poll::Ready(Ok(()))
    }
}

fn result_status(result: &ImportResult) -> JobStatus {
    if result.cancelled {
        JobStatus::Cancelled
    } else if result.failure.is_some() {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    }
}

fn failure_status(failure: &ImportFailure) -> JobStatus {
    match failure {
        ImportFailure::Cancelled => JobStatus::Cancelled,
        _ => JobStatus::Failed,
    }
}

/// Upload a delimited or markup file and load it into the target.
///
/// The body is streamed straight into the parser. The format comes from the
/// Content-Type header, or from the extension of `file_name` when the content
/// type is missing or generic. A body larger than the configured upload limit
/// fails the job; batches committed before the limit was hit stay.
#[post("/imports?<file_name>", data = "<body>")]
pub async fn create_import(
    file_name: Option<String>,
    content_type: Option<&ContentType>,
    descriptor: ImportRequestHeader,
    body: Data<'_>,
    engine: &State<ImportEngine>,
    registry: &State<JobRegistry>,
) -> Result<Json<ImportResponse>, ApiError> {
    let mut request = descriptor.0.map_err(ApiError::BadRequest)?;
    let config = engine.config();
    if request.actor.trim().is_empty() {
        request.actor = config.default_actor.clone();
    }

    let media_type = content_type.map(|ct| ct.to_string());
    let job = registry.register(JobKind::Import, &request.target).await;
    let limit = config.max_upload_bytes;
    let stream = LimitedUpload::new(body.open(limit.saturating_add(1).bytes()), limit);

    let outcome = engine
        .run_import_with_progress(
            stream,
            file_name.as_deref(),
            media_type.as_deref(),
            &request,
            &job.cancellation_token,
            Some(&job.progress),
        )
        .await;

    match outcome {
        Ok(result) => {
            let status = result_status(&result);
            let response = ImportResponse::new(job.id, result);
            finish_job(registry, &job.id, status, Some(&response), response.failure.clone()).await;
            Ok(Json(response))
        }
        Err(failure) => {
            log::warn!("import job {} rejected: {}", job.id, failure);
            finish_job::<ImportResponse>(
                registry,
                &job.id,
                failure_status(&failure),
                None,
                Some(failure.to_string()),
            )
            .await;
            Err(failure.into())
        }
    }
}

/// Overwrite stored rows with duplicates reported by an earlier import.
#[openapi(tag = "Imports")]
#[post("/imports/duplicates", data = "<payload>")]
pub async fn apply_duplicates(
    payload: Json<ApplyDuplicatesRequest>,
    engine: &State<ImportEngine>,
    registry: &State<JobRegistry>,
) -> Result<Json<ImportResponse>, ApiError> {
    let ApplyDuplicatesRequest { mut request, rows } = payload.into_inner();
    if request.actor.trim().is_empty() {
        request.actor = engine.config().default_actor.clone();
    }

    let job = registry
        .register(JobKind::ApplyDuplicates, &request.target)
        .await;

    match engine.apply_duplicates(&request, &rows).await {
        Ok(result) => {
            let response = ImportResponse::new(job.id, result);
            finish_job(registry, &job.id, JobStatus::Completed, Some(&response), None).await;
            Ok(Json(response))
        }
        Err(failure) => {
            finish_job::<ImportResponse>(
                registry,
                &job.id,
                failure_status(&failure),
                None,
                Some(failure.to_string()),
            )
            .await;
            Err(failure.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_limited_upload_accepts_body_at_limit() {
        let mut out = String::new();
        LimitedUpload::new(&b"id,name\n"[..], 8)
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "id,name\n");
    }

    #[tokio::test]
    async fn test_limited_upload_fails_past_limit() {
        let mut out = Vec::new();
        let err = LimitedUpload::new(&b"id,name\n1,Ann\n"[..], 8)
            .read_to_end(&mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("8 bytes"));
    }
}
