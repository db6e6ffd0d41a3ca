use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

/// Fairing to log one line per HTTP request with timing
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let elapsed = request.local_cache(Instant::now).elapsed();
        let status = response.status();
        let job = response.headers().get_one("X-Job-Id").unwrap_or("-");

        if status.code >= 500 {
            log::warn!(
                "{} {} -> {} job={} ({:.2}ms)",
                request.method(),
                request.uri(),
                status.code,
                job,
                elapsed.as_secs_f64() * 1000.0
            );
        } else {
            log::info!(
                "{} {} -> {} job={} ({:.2}ms)",
                request.method(),
                request.uri(),
                status.code,
                job,
                elapsed.as_secs_f64() * 1000.0
            );
        }
    }
}
