use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::models::job::{Job, JobStatus};

/// Recommended interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Give up after this long. `None` polls until a terminal status.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Final record of a poll, with every distinct status seen on the way.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub job: Job,
    pub observed: Vec<JobStatus>,
}

/// Fetch the job repeatedly until it reaches DONE or ERROR.
///
/// Fetching is expected to be side-effect free, so the interval only bounds
/// load; any fetch error ends the poll.
pub async fn poll_until_terminal<F, Fut, E>(
    mut fetch: F,
    policy: &PollPolicy,
) -> Result<PollOutcome, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Job, E>>,
    E: std::error::Error + 'static,
{
    let started = Instant::now();
    let mut observed: Vec<JobStatus> = Vec::new();

    loop {
        let job = fetch().await.map_err(PollError::Fetch)?;
        if observed.last() != Some(&job.status) {
            tracing::debug!(job_id = %job.id, status = %job.status, "Job status changed");
            observed.push(job.status);
        }
        if job.status.is_terminal() {
            return Ok(PollOutcome { job, observed });
        }

        if let Some(timeout) = policy.timeout {
            if started.elapsed() >= timeout {
                return Err(PollError::TimedOut {
                    elapsed: started.elapsed(),
                    last_status: job.status,
                });
            }
        }
        sleep(policy.interval).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("Fetching job status failed: {0}")]
    Fetch(#[source] E),

    #[error("Job still {last_status} after {elapsed:?}")]
    TimedOut {
        elapsed: Duration,
        last_status: JobStatus,
    },
}
