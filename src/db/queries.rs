use crate::models::job::{Job, JobOutputs, JobPatch};

use super::{JobStore, StoreError};

/// Insert a new PENDING job
pub async fn create_job(store: &JobStore, job: &Job) -> Result<(), StoreError> {
    store.insert(job.clone()).await
}

/// Get a job by ID
pub async fn get_job(store: &JobStore, job_id: &str) -> Result<Option<Job>, StoreError> {
    store.find_by_id(job_id).await
}

/// Mark a job as running once its worker process is up
pub async fn mark_running(store: &JobStore, job_id: &str) -> Result<Option<Job>, StoreError> {
    store.upsert(job_id, JobPatch::running()).await
}

/// Record a successful completion with its artifact locations
pub async fn mark_done(
    store: &JobStore,
    job_id: &str,
    outputs: JobOutputs,
) -> Result<Option<Job>, StoreError> {
    store.upsert(job_id, JobPatch::done(outputs)).await
}

/// Record a failure with its diagnostic text
pub async fn mark_failed(
    store: &JobStore,
    job_id: &str,
    error: &str,
) -> Result<Option<Job>, StoreError> {
    store.upsert(job_id, JobPatch::failed(error)).await
}
