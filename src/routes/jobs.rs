//! Job inspection and cancellation.

use crate::error::ApiError;
use crate::jobs::{JobRegistry, JobState};
use crate::routes::helpers::parse_job_id;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

/// List every job known to this process, newest first.
#[openapi(tag = "Jobs")]
#[get("/jobs")]
pub async fn list_jobs(registry: &State<JobRegistry>) -> Json<Vec<JobState>> {
    Json(registry.list().await)
}

/// Current state of one job, including live progress while it runs.
#[openapi(tag = "Jobs")]
#[get("/jobs/<id>")]
pub async fn get_job(id: String, registry: &State<JobRegistry>) -> Result<Json<JobState>, ApiError> {
    let id = parse_job_id(&id)?;
    registry
        .get_state(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

/// Request cancellation of a running job.
///
/// Batches already committed stay committed; the job reports itself as
/// cancelled once it has stopped.
#[openapi(tag = "Jobs")]
#[post("/jobs/<id>/cancel")]
pub async fn cancel_job(
    id: String,
    registry: &State<JobRegistry>,
) -> Result<Json<JobState>, ApiError> {
    let id = parse_job_id(&id)?;
    registry
        .cancel(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}
