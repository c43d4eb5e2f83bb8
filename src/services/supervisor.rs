//! Worker process supervision.
//!
//! [`WorkerSupervisor::start`] launches one external worker per job, marks the
//! job RUNNING once the process exists, and hands the child to a supervising
//! task. That task is the only writer of the job's terminal state: it waits
//! for the process (or a cancellation request), then records DONE with the
//! resolved outputs or ERROR with the captured stderr text.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::{queries, JobStore, StoreError};
use crate::models::job::{Job, JobOutputs, JobStatus};
use crate::services::outputs::OutputLayout;

/// Upper bound on stderr kept for the job's error field (1 MiB).
const MAX_STDERR_BYTES: usize = 1024 * 1024;

/// How long to wait for output pipes to close after the worker exits.
/// A grandchild holding a pipe open must not keep the job from finishing.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts at writing a job's ERROR state before leaving the record as is.
const FAILURE_RECORD_ATTEMPTS: u32 = 4;
const FAILURE_RECORD_BACKOFF: Duration = Duration::from_millis(250);

/// Program and fixed leading arguments of the worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub command: WorkerCommand,
    /// Directory that image references resolve against.
    pub uploads_dir: PathBuf,
    pub outputs: OutputLayout,
    pub verify_artifacts: bool,
}

impl SupervisorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            command: WorkerCommand {
                program: config.worker_program.clone(),
                leading_args: config.worker_leading_args(),
            },
            uploads_dir: config.uploads_dir(),
            outputs: OutputLayout::new(config.outputs_dir(), config.output_url_prefix.clone()),
            verify_artifacts: config.verify_artifacts,
        }
    }
}

/// Launches worker processes and turns their lifecycle into store updates.
#[derive(Clone)]
pub struct WorkerSupervisor {
    store: Arc<JobStore>,
    settings: Arc<SupervisorSettings>,
    running: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

/// Handle to a supervised worker.
pub struct WorkerHandle {
    job_id: String,
    pid: Option<u32>,
    task: JoinHandle<JobStatus>,
}

impl WorkerHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait until the job's terminal state has been recorded.
    pub async fn wait(self) -> JobStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Supervisor task aborted");
                JobStatus::Error
            }
        }
    }
}

impl WorkerSupervisor {
    pub fn new(store: Arc<JobStore>, settings: SupervisorSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn outputs(&self) -> &OutputLayout {
        &self.settings.outputs
    }

    /// Arguments passed to the worker for `job`, writing into `out_dir`.
    pub fn worker_args(&self, job: &Job, out_dir: &Path) -> Vec<OsString> {
        let settings = &self.settings;
        let mut args: Vec<OsString> = settings
            .command
            .leading_args
            .iter()
            .map(OsString::from)
            .collect();
        args.extend([
            OsString::from("--image_a"),
            settings.uploads_dir.join(&job.image_a_id).into_os_string(),
            OsString::from("--image_b"),
            settings.uploads_dir.join(&job.image_b_id).into_os_string(),
            OsString::from("--aoi"),
            OsString::from(job.aoi.to_worker_arg()),
            OsString::from("--out_dir"),
            out_dir.as_os_str().to_os_string(),
        ]);
        args
    }

    /// Launch the worker for a PENDING job.
    ///
    /// On success the job is RUNNING when this returns. If the process cannot
    /// be launched the job goes straight to ERROR and the error is returned
    /// for logging only; the failure is already recorded in the job.
    pub async fn start(&self, job: &Job) -> Result<WorkerHandle, WorkerError> {
        let out_dir = self.settings.outputs.job_dir(&job.id);
        if let Err(source) = tokio::fs::create_dir_all(&out_dir).await {
            let err = WorkerError::OutputDir {
                path: out_dir,
                source,
            };
            self.record_failure(&job.id, &err).await;
            return Err(err);
        }

        let args = self.worker_args(job, &out_dir);
        let program = &self.settings.command.program;
        tracing::info!(job_id = %job.id, program = %program, args = ?args, "Spawning worker");

        let spawned = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let err = WorkerError::Launch {
                    program: program.clone(),
                    source,
                };
                self.record_failure(&job.id, &err).await;
                return Err(err);
            }
        };
        let pid = child.id();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.lock_running().insert(job.id.clone(), cancel_tx);

        match queries::mark_running(&self.store, &job.id).await {
            Ok(Some(_)) => {}
            outcome => {
                // Cancelled or removed while launching; the process must not outlive that.
                self.lock_running().remove(&job.id);
                let _ = child.start_kill();
                let _ = child.wait().await;
                let err = match outcome {
                    Err(StoreError::InvalidTransition { from, .. }) => WorkerError::NotRunnable(from),
                    Err(e) => WorkerError::Store(e),
                    Ok(_) => WorkerError::UnknownJob(job.id.clone()),
                };
                tracing::warn!(job_id = %job.id, error = %err, "Worker killed right after launch");
                if matches!(err, WorkerError::Store(_)) {
                    // The job is still PENDING; it must not stay that way.
                    self.record_failure(&job.id, &err).await;
                }
                return Err(err);
            }
        }

        metrics::gauge!("raster_jobs_running").increment(1.0);
        tracing::info!(job_id = %job.id, pid = ?pid, "Worker running");

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(log_stdout(job.id.clone(), stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(job.id.clone(), stderr)));

        let supervisor = self.clone();
        let job_id = job.id.clone();
        let task = tokio::spawn(async move {
            supervisor
                .supervise(job_id, child, cancel_rx, stdout_task, stderr_task)
                .await
        });

        Ok(WorkerHandle {
            job_id: job.id.clone(),
            pid,
            task,
        })
    }

    /// Ask the worker of `job_id` to stop. Returns false if no worker is running for it.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock_running().remove(job_id) {
            Some(cancel_tx) => cancel_tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock_running().contains_key(job_id)
    }

    async fn supervise(
        self,
        job_id: String,
        mut child: Child,
        mut cancel_rx: oneshot::Receiver<()>,
        stdout_task: Option<JoinHandle<()>>,
        stderr_task: Option<JoinHandle<String>>,
    ) -> JobStatus {
        let started = Instant::now();

        let exit = tokio::select! {
            status = child.wait() => status.map(Some),
            Ok(()) = &mut cancel_rx => {
                tracing::info!(job_id = %job_id, "Cancelling worker");
                let _ = child.start_kill();
                child.wait().await.map(|_| None)
            }
        };

        // The process is gone; a cancel from now on has nothing to stop.
        self.lock_running().remove(&job_id);
        drop(cancel_rx);
        metrics::gauge!("raster_jobs_running").decrement(1.0);

        let stderr = match stderr_task {
            Some(task) => drain(&job_id, task).await.unwrap_or_default(),
            None => String::new(),
        };
        if let Some(task) = stdout_task {
            drain(&job_id, task).await;
        }

        metrics::histogram!("raster_job_duration_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match exit {
            Ok(Some(status)) if status.success() => self.resolve_outputs(&job_id).await,
            Ok(Some(status)) => Err(WorkerError::Exited {
                code: status.code(),
                stderr,
            }),
            Ok(None) => Err(WorkerError::Cancelled),
            Err(e) => Err(WorkerError::Wait(e)),
        };

        match outcome {
            Ok(outputs) => match queries::mark_done(&self.store, &job_id, outputs).await {
                Ok(_) => {
                    metrics::counter!("raster_jobs_completed_total").increment(1);
                    tracing::info!(
                        job_id = %job_id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Job completed successfully"
                    );
                    JobStatus::Done
                }
                Err(e @ StoreError::InvalidTransition { .. }) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job completion");
                    self.current_status(&job_id).await
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job completion");
                    self.record_failure(&job_id, &WorkerError::Store(e)).await
                }
            },
            Err(err) => self.record_failure(&job_id, &err).await,
        }
    }

    async fn resolve_outputs(&self, job_id: &str) -> Result<JobOutputs, WorkerError> {
        let outputs = self.settings.outputs.resolve(job_id);
        if self.settings.verify_artifacts {
            for path in [&outputs.image_a_path, &outputs.image_b_path] {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(WorkerError::MissingArtifact(path.clone()));
                }
            }
        }
        Ok(outputs)
    }

    /// Record `err` as the job's diagnostic and move it to ERROR.
    ///
    /// Store failures are retried with a growing delay; a record that is
    /// already terminal is left alone.
    async fn record_failure(&self, job_id: &str, err: &WorkerError) -> JobStatus {
        tracing::warn!(job_id = %job_id, error = %err, "Job failed");
        let message = err.to_string();
        for attempt in 1..=FAILURE_RECORD_ATTEMPTS {
            match queries::mark_failed(&self.store, job_id, &message).await {
                Ok(_) => {
                    metrics::counter!("raster_jobs_failed_total").increment(1);
                    return JobStatus::Error;
                }
                Err(e @ StoreError::InvalidTransition { .. }) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                    break;
                }
                Err(e) if attempt < FAILURE_RECORD_ATTEMPTS => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt,
                        error = %e,
                        "Recording job failure failed, retrying"
                    );
                    tokio::time::sleep(FAILURE_RECORD_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                }
            }
        }
        self.current_status(job_id).await
    }

    async fn current_status(&self, job_id: &str) -> JobStatus {
        match queries::get_job(&self.store, job_id).await {
            Ok(Some(job)) => job.status,
            _ => JobStatus::Error,
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn drain<T>(job_id: &str, mut task: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(STREAM_DRAIN_TIMEOUT, &mut task).await {
        Ok(result) => result.ok(),
        Err(_) => {
            tracing::warn!(job_id = %job_id, "Worker output still open after exit, abandoning it");
            task.abort();
            None
        }
    }
}

async fn log_stdout<R: AsyncRead + Unpin>(job_id: String, stdout: R) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(job_id = %job_id, line = %line, "Worker stdout");
    }
}

/// Accumulate stderr verbatim, logging each chunk as it arrives.
/// Reading continues past the cap so the worker never blocks on a full pipe.
async fn collect_stderr<R: AsyncRead + Unpin>(job_id: String, mut stderr: R) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                tracing::warn!(
                    job_id = %job_id,
                    output = %String::from_utf8_lossy(&chunk[..n]).trim_end(),
                    "Worker stderr"
                );
                let room = MAX_STDERR_BYTES.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

fn exit_message(code: &Option<i32>, stderr: &str) -> String {
    if !stderr.trim().is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("Worker exited with code {code}"),
        None => "Worker terminated without an exit code".to_string(),
    }
}

/// Failures of a supervised worker. The `Display` text is what ends up in the
/// job's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),

    #[error("{}", exit_message(.code, .stderr))]
    Exited { code: Option<i32>, stderr: String },

    #[error("Worker exited successfully but artifact {} is missing", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job is {0}, not pending")]
    NotRunnable(JobStatus),

    #[error("Job {0} does not exist")]
    UnknownJob(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_message_prefers_stderr() {
        let err = WorkerError::Exited {
            code: Some(1),
            stderr: "alignment failed: insufficient overlap".to_string(),
        };
        assert_eq!(err.to_string(), "alignment failed: insufficient overlap");
    }

    #[test]
    fn test_exit_message_synthesized_when_stderr_empty() {
        let err = WorkerError::Exited {
            code: Some(2),
            stderr: "\n".to_string(),
        };
        assert_eq!(err.to_string(), "Worker exited with code 2");

        let killed = WorkerError::Exited {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.to_string(), "Worker terminated without an exit code");
    }

    #[tokio::test]
    async fn test_collect_stderr_is_verbatim() {
        let input: &[u8] = b"line one\nline two";
        let captured = collect_stderr("job".to_string(), input).await;
        assert_eq!(captured, "line one\nline two");
    }
}
