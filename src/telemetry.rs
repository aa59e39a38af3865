use tracing_subscriber::EnvFilter;

/// Structured JSON logging, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for the application metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "extraction_requests_triggered",
        "Extraction requests queued through the trigger endpoint"
    );
    metrics::describe_counter!(
        "extraction_jobs_completed",
        "Extraction requests that reached the completed state"
    );
    metrics::describe_counter!(
        "extraction_jobs_failed",
        "Extraction requests that failed, by pipeline stage"
    );
    metrics::describe_counter!(
        "extraction_jobs_degraded",
        "Completed requests that fell back to placeholder values"
    );
    metrics::describe_counter!(
        "extraction_documents_failed",
        "Input documents that yielded no text"
    );
    metrics::describe_histogram!(
        "extraction_processing_seconds",
        "Time to process an extraction request"
    );
    metrics::describe_gauge!(
        "extraction_queue_depth",
        "Current number of queued extraction requests"
    );
}
