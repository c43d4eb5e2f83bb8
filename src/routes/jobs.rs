use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::models::job::{CreateJobRequest, Job};
use crate::services::jobs::JobError;

/// Response after submitting a job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: String,
}

/// POST /api/jobs — submit an image pair and AOI for alignment.
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Json<CreateJobResponse>, JobError> {
    let Json(request) = payload.map_err(|rejection| JobError::InvalidRequest(rejection.body_text()))?;
    let job_id = state.jobs.create(request).await?;
    Ok(Json(CreateJobResponse { job_id }))
}

/// GET /api/jobs/{job_id} — current job record.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, JobError> {
    Ok(Json(state.jobs.get(&job_id).await?))
}

/// POST /api/jobs/{job_id}/cancel — stop an unfinished job.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Job>), JobError> {
    let job = state.jobs.cancel(&job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}
