use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use raster_align::client::ApiClient;
use raster_align::models::job::{Aoi, CreateJobRequest, JobStatus};
use raster_align::services::polling::PollPolicy;

/// Submit an image pair for clipping and alignment, then poll until the job finishes.
#[derive(Debug, Parser)]
#[command(name = "raster-align-submit", version)]
struct Args {
    /// Base URL of the raster-align API
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8080")]
    api: String,

    /// Upload id of the reference image
    #[arg(long)]
    image_a: String,

    /// Upload id of the image to align
    #[arg(long)]
    image_b: String,

    #[arg(long, allow_hyphen_values = true)]
    north: f64,
    #[arg(long, allow_hyphen_values = true)]
    south: f64,
    #[arg(long, allow_hyphen_values = true)]
    east: f64,
    #[arg(long, allow_hyphen_values = true)]
    west: f64,

    /// Seconds between status polls
    #[arg(long, default_value_t = 2)]
    interval: u64,

    /// Give up after this many seconds (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = ApiClient::new(&args.api);

    let request = CreateJobRequest::new(
        args.image_a,
        args.image_b,
        Aoi {
            north: args.north,
            south: args.south,
            east: args.east,
            west: args.west,
        },
    );

    let job_id = match client.submit(&request).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "Job submission failed");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(job_id = %job_id, "Job submitted");

    let policy = PollPolicy {
        interval: Duration::from_secs(args.interval.max(1)),
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
    };

    match client.wait(&job_id, &policy).await {
        Ok(outcome) => {
            tracing::info!(job_id = %job_id, observed = ?outcome.observed, "Job finished");
            match serde_json::to_string_pretty(&outcome.job) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::error!(error = %e, "Failed to render job"),
            }
            if outcome.job.status == JobStatus::Done {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Polling failed");
            ExitCode::FAILURE
        }
    }
}
