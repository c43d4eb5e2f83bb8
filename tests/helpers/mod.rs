//! Test helper utilities shared by the integration suites

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use raster_align::app_state::AppState;
use raster_align::db::JobStore;
use raster_align::models::job::{CreateJobRequest, JobStatus};
use raster_align::services::jobs::{JobError, JobService};
use raster_align::services::outputs::OutputLayout;
use raster_align::services::polling::{poll_until_terminal, PollError, PollOutcome, PollPolicy};
use raster_align::services::supervisor::{SupervisorSettings, WorkerCommand};

use crate::fixtures::SCENARIO_AOI;

/// A job service over a scratch data directory and a stub worker.
pub struct Harness {
    pub dir: TempDir,
    pub state: AppState,
}

impl Harness {
    pub fn service(&self) -> &JobService {
        &self.state.jobs
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.state.store()
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.dir.path().join("jobs.json")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }
}

/// Harness running `script` through `sh`.
pub async fn harness(script: &str) -> Harness {
    harness_with(script, false).await
}

pub async fn harness_with(script: &str, verify_artifacts: bool) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let script_path = dir.path().join("worker.sh");
    std::fs::write(&script_path, script).expect("Failed to write stub worker");

    let command = WorkerCommand {
        program: "sh".to_string(),
        leading_args: vec![script_path.display().to_string()],
    };
    build(dir, command, verify_artifacts).await
}

/// Harness whose worker program does not exist.
pub async fn harness_with_missing_program() -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let command = WorkerCommand {
        program: dir
            .path()
            .join("no-such-worker")
            .display()
            .to_string(),
        leading_args: Vec::new(),
    };
    build(dir, command, false).await
}

async fn build(dir: TempDir, command: WorkerCommand, verify_artifacts: bool) -> Harness {
    let store = JobStore::open(dir.path().join("jobs.json"))
        .await
        .expect("Failed to open job store");
    let settings = SupervisorSettings {
        command,
        uploads_dir: dir.path().join("uploads"),
        outputs: OutputLayout::new(dir.path().join("outputs"), "/data/outputs"),
        verify_artifacts,
    };
    let state = AppState::new(store, settings);
    Harness { dir, state }
}

/// The scenario submission: two uploads and a 10x10 AOI.
pub fn scenario_request() -> CreateJobRequest {
    CreateJobRequest::new("scene_a.tif", "scene_b.tif", SCENARIO_AOI)
}

pub fn fast_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(20),
        timeout: Some(Duration::from_secs(20)),
    }
}

/// Poll the service until the job is terminal.
pub async fn wait_for_terminal(
    service: &JobService,
    job_id: &str,
) -> Result<PollOutcome, PollError<JobError>> {
    poll_until_terminal(move || service.get(job_id), &fast_policy()).await
}

/// Poll until the job reports `status` (used to catch RUNNING).
pub async fn wait_for_status(service: &JobService, job_id: &str, status: JobStatus) {
    for _ in 0..500 {
        let job = service.get(job_id).await.expect("Job disappeared");
        if job.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Job {job_id} never reached {status}");
}
