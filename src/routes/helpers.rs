//! Shared helper functions for Rocket route handlers.

use crate::error::ApiError;
use crate::jobs::{JobRegistry, JobStatus};
use serde::Serialize;
use uuid::Uuid;

/// Parse a job identifier taken from the path.
pub fn parse_job_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest(format!("'{id}' is not a valid job id")))
}

/// Record a finished job, serializing its result document.
pub async fn finish_job<T: Serialize>(
    registry: &JobRegistry,
    id: &Uuid,
    status: JobStatus,
    result: Option<&T>,
    error_message: Option<String>,
) {
    let document = result.and_then(|value| match serde_json::to_value(value) {
        Ok(document) => Some(document),
        Err(err) => {
            log::warn!("failed to serialize result of job {}: {}", id, err);
            None
        }
    });
    registry.finish(id, status, document, error_message).await;
}
