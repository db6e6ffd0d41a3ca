//! Export endpoint streaming a source table as a file download.

use crate::error::ApiError;
use crate::export::{ExportEngine, ExportError, ExportResult};
use crate::jobs::{JobKind, JobRegistry, JobStatus};
use crate::routes::helpers::finish_job;
use crate::schema::{ExportJobRequest, FileFormat};
use rocket::State;
use rocket::http::{ContentType, Header};
use rocket::request::Request;
use rocket::response::stream::{One, ReaderStream};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use tokio::io::DuplexStream;

/// Bytes buffered between the serializer task and the response body.
const EXPORT_PIPE_BYTES: usize = 64 * 1024;

pub struct ExportDownload {
    body: ReaderStream<One<DuplexStream>>,
    content_type: ContentType,
    job_id: Header<'static>,
    disposition: Header<'static>,
}

impl<'r> Responder<'r, 'r> for ExportDownload {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'r> {
        Response::build_from(self.body.respond_to(request)?)
            .header(self.content_type)
            .header(self.job_id)
            .header(self.disposition)
            .ok()
    }
}

fn download_name(source: &str, format: FileFormat) -> String {
    let stem: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{}.{}", stem, format.extension())
}

/// Export rows of a table as delimited text or markup.
///
/// The column projection is resolved before the response starts, so unknown
/// tables and columns are answered with a JSON error. Rows are then
/// serialized on a background task and streamed as they are produced.
#[post("/exports", data = "<request>")]
pub async fn create_export(
    request: Json<ExportJobRequest>,
    engine: &State<ExportEngine>,
    registry: &State<JobRegistry>,
) -> Result<ExportDownload, ApiError> {
    let request = request.into_inner();
    if request.format == FileFormat::Delimited {
        request.options.delimiter_byte().map_err(ApiError::BadRequest)?;
    }
    engine.resolve_columns(&request).await?;

    let job = registry.register(JobKind::Export, &request.source).await;
    let (writer, reader) = tokio::io::duplex(EXPORT_PIPE_BYTES);

    let content_type = match request.format {
        FileFormat::Delimited => ContentType::CSV,
        FileFormat::Markup => ContentType::XML,
    };
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download_name(&request.source, request.format)
    );

    let engine = engine.inner().clone();
    let registry = registry.inner().clone();
    let job_id = job.id;
    let cancel = job.cancellation_token.clone();
    tokio::spawn(async move {
        match engine.run_export(&request, writer, &cancel).await {
            Ok(result) => {
                finish_job(&registry, &job_id, JobStatus::Completed, Some(&result), None).await;
            }
            Err(ExportError::Cancelled) => {
                finish_job::<ExportResult>(
                    &registry,
                    &job_id,
                    JobStatus::Cancelled,
                    None,
                    Some(ExportError::Cancelled.to_string()),
                )
                .await;
            }
            Err(err) => {
                log::error!("export job {} of {} failed: {}", job_id, request.source, err);
                finish_job::<ExportResult>(
                    &registry,
                    &job_id,
                    JobStatus::Failed,
                    None,
                    Some(err.to_string()),
                )
                .await;
            }
        }
    });

    Ok(ExportDownload {
        body: ReaderStream::one(reader),
        content_type,
        job_id: Header::new("X-Job-Id", job.id.to_string()),
        disposition: Header::new("Content-Disposition", disposition),
    })
}
