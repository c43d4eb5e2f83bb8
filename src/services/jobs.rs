use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::db::{queries, JobStore, StoreError};
use crate::models::job::{CreateJobRequest, Job, JobPatch, JobStatus};
use crate::services::supervisor::WorkerSupervisor;

/// Public job operations: create, get, update and cancel.
///
/// The service keeps no job state of its own; every call reads the store, so
/// several service instances over one document observe the same jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<JobStore>,
    supervisor: WorkerSupervisor,
}

impl JobService {
    pub fn new(store: Arc<JobStore>, supervisor: WorkerSupervisor) -> Self {
        Self { store, supervisor }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Validate the request, persist a PENDING job and launch its worker in
    /// the background. Returns the new job id without waiting for the worker.
    pub async fn create(&self, request: CreateJobRequest) -> Result<String, JobError> {
        let inputs = request.into_inputs().map_err(JobError::InvalidRequest)?;
        let job = Job::new(inputs);
        queries::create_job(&self.store, &job).await?;

        metrics::counter!("raster_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            image_a = %job.image_a_id,
            image_b = %job.image_b_id,
            aoi = %job.aoi.to_worker_arg(),
            "Job created"
        );

        let id = job.id.clone();
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            // Launch failures are already recorded in the job.
            if let Err(e) = supervisor.start(&job).await {
                tracing::debug!(job_id = %job.id, error = %e, "Worker did not start");
            }
        });

        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Job, JobError> {
        queries::get_job(&self.store, id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Merge `patch` into a job through the store. Unknown ids are a no-op.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<Option<Job>, JobError> {
        Ok(self.store.upsert(id, patch).await?)
    }

    /// Stop a job that has not finished yet.
    ///
    /// A running worker is killed and its supervisor records the ERROR; a job
    /// whose worker has not started is failed directly. A RUNNING job without
    /// a live worker on this instance is left to its supervisor. Returns the record as
    /// observed when the cancellation was issued.
    pub async fn cancel(&self, id: &str) -> Result<Job, JobError> {
        let job = self.get(id).await?;
        if job.status.is_terminal() {
            return Err(JobError::AlreadyFinished {
                id: id.to_string(),
                status: job.status,
            });
        }

        if self.supervisor.cancel(id) {
            tracing::info!(job_id = %id, "Cancellation sent to worker");
            return Ok(job);
        }
        if job.status == JobStatus::Running {
            // Its worker already exited here, or it runs under another instance.
            return Err(JobError::NotCancellable(id.to_string()));
        }

        match queries::mark_failed(&self.store, id, "Job cancelled before launch").await {
            Ok(Some(cancelled)) => {
                metrics::counter!("raster_jobs_failed_total").increment(1);
                tracing::info!(job_id = %id, "Job cancelled before launch");
                // A launch racing this update is stopped here or by its own RUNNING check.
                self.supervisor.cancel(id);
                Ok(cancelled)
            }
            Ok(None) => Err(JobError::NotFound(id.to_string())),
            // Only a terminal record refuses a move to ERROR.
            Err(StoreError::InvalidTransition { from, .. }) => Err(JobError::AlreadyFinished {
                id: id.to_string(),
                status: from,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} already finished with status {status}")]
    AlreadyFinished { id: String, status: JobStatus },

    #[error("Job {0} has no cancellable worker on this instance")]
    NotCancellable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = match &self {
            JobError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::AlreadyFinished { .. } | JobError::NotCancellable(_) => StatusCode::CONFLICT,
            JobError::Store(e) => {
                tracing::error!(error = %e, "Job store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
