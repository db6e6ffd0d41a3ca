//! HTTP route handlers grouped by resource.
//!
//! JSON endpoints are annotated with `#[openapi]` so `rocket_okapi` can
//! derive the OpenAPI document. The upload and download endpoints stream
//! raw bodies and are mounted as plain Rocket routes.

pub mod exports;
pub mod health;
pub(crate) mod helpers;
pub mod imports;
pub mod jobs;
