use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use template_spreader::{
    config::AppConfig,
    db,
    services::{
        gemini::GeminiGenerator,
        generation::GenerationClient,
        orchestrator::{JobOrchestrator, RunOutcome},
        queue::JobQueue,
        request_store::PgRequestStore,
        storage::S3BlobStore,
    },
    telemetry,
};
use tokio::time::sleep;
use uuid::Uuid;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_logging();

    tracing::info!("Starting extraction worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let one_shot = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("REQUEST_ID").ok());

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let storage = S3BlobStore::new(
        &config.blob_bucket,
        &config.blob_endpoint,
        &config.blob_region,
        &config.blob_access_key,
        &config.blob_secret_key,
    )
    .expect("Failed to initialize blob storage client");

    let generator = GeminiGenerator::new(
        config.gemini_base_url.clone(),
        config.gemini_model.clone(),
        config.gemini_api_key.clone(),
        config.generator_timeout(),
    )
    .expect("Failed to initialize Gemini client");

    let orchestrator = JobOrchestrator::new(
        Arc::new(PgRequestStore::new(db_pool)),
        Arc::new(storage),
        GenerationClient::new(
            Arc::new(generator),
            config.generator_timeout(),
            config.max_context_chars,
        ),
        config.schema_options(),
    );

    if let Some(raw_id) = one_shot {
        return run_once(&orchestrator, &raw_id).await;
    }

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    telemetry::describe_metrics();

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");
    queue
        .health_check()
        .await
        .expect("Failed to reach Redis job queue");

    match queue.requeue_stranded().await {
        Ok(0) => {}
        Ok(requeued) => {
            tracing::warn!(requeued, "Requeued jobs left in the processing list");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to requeue jobs left in the processing list");
        }
    }

    tracing::info!(metrics_addr = %metrics_addr, "Worker ready, starting job processing loop");

    loop {
        match process_next_job(&queue, &orchestrator).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will keep polling");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Job-runner mode: process one request and report the outcome through the exit code.
async fn run_once(orchestrator: &JobOrchestrator, raw_id: &str) -> ExitCode {
    let request_id = match Uuid::parse_str(raw_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(request_id = %raw_id, error = %e, "Invalid request id");
            return ExitCode::from(2);
        }
    };

    match orchestrator.run(request_id).await {
        Ok(RunOutcome::Completed { .. }) | Ok(RunOutcome::Skipped) => ExitCode::SUCCESS,
        Ok(RunOutcome::Failed { .. }) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(%request_id, error = %e, "Request could not be processed");
            ExitCode::FAILURE
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a job was processed, Ok(false) if no job available.
async fn process_next_job(
    queue: &JobQueue,
    orchestrator: &JobOrchestrator,
) -> Result<bool, Box<dyn std::error::Error>> {
    let Some(job) = queue.dequeue().await? else {
        return Ok(false);
    };

    tracing::info!(request_id = %job.request_id, "Dequeued extraction request");

    let outcome = orchestrator.run(job.request_id).await;
    // Done with the queue entry whatever the outcome.
    queue.complete(&job).await?;

    if let Ok(depth) = queue.queue_depth().await {
        metrics::gauge!("extraction_queue_depth").set(depth as f64);
    }

    match outcome? {
        RunOutcome::Completed { quality, .. } => {
            tracing::info!(request_id = %job.request_id, quality = %quality, "Job completed");
        }
        RunOutcome::Failed { stage, message } => {
            tracing::warn!(
                request_id = %job.request_id,
                stage = %stage,
                error = %message,
                "Job failed"
            );
        }
        RunOutcome::Skipped => {}
    }
    Ok(true)
}
