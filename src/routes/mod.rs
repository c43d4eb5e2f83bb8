use axum::routing::{get, post};
use axum::Router;
use tower_http::services::ServeDir;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Job API, health check and served job outputs.
pub fn router(state: AppState) -> Router {
    let layout = state.jobs.supervisor().outputs().clone();

    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", post(jobs::create_job))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .route("/api/jobs/{job_id}/cancel", post(jobs::cancel_job));

    // Outputs behind an absolute URL are served by someone else.
    if layout.url_prefix().starts_with('/') && layout.url_prefix().len() > 1 {
        router = router.nest_service(layout.url_prefix(), ServeDir::new(layout.root()));
    }

    router.with_state(state)
}
