use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use raster_align::app_state::AppState;
use raster_align::config::AppConfig;
use raster_align::db::JobStore;
use raster_align::routes;
use raster_align::services::supervisor::SupervisorSettings;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing raster-align server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("raster_jobs_submitted_total", "Total alignment jobs submitted");
    metrics::describe_counter!(
        "raster_jobs_completed_total",
        "Total alignment jobs whose worker exited successfully"
    );
    metrics::describe_counter!(
        "raster_jobs_failed_total",
        "Total alignment jobs that ended in ERROR"
    );
    metrics::describe_gauge!("raster_jobs_running", "Worker processes currently running");
    metrics::describe_histogram!(
        "raster_job_duration_seconds",
        "Wall time of a worker process from launch to exit"
    );

    // Data directories
    for dir in [config.uploads_dir(), config.outputs_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .unwrap_or_else(|e| panic!("Failed to create {}: {e}", dir.display()));
    }

    // Open the job store; a corrupt document halts startup unless the
    // operator opted into reinitialization.
    tracing::info!(path = %config.jobs_file().display(), "Opening job store");
    let store = if config.reinitialize_corrupt_store {
        JobStore::open_or_reinitialize(config.jobs_file()).await
    } else {
        JobStore::open(config.jobs_file()).await
    }
    .expect("Failed to open job store");

    let state = AppState::new(store, SupervisorSettings::from_config(&config));

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting raster-align on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
