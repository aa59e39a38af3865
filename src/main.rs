use std::sync::Arc;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use template_spreader::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{queue::JobQueue, storage::S3BlobStore},
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_logging();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing template-spreader API");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    telemetry::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing blob storage client");
    let storage = S3BlobStore::new(
        &config.blob_bucket,
        &config.blob_endpoint,
        &config.blob_region,
        &config.blob_access_key,
        &config.blob_secret_key,
    )
    .expect("Failed to initialize blob storage client");

    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let state = AppState::new(
        db_pool,
        Arc::new(storage),
        queue,
        config.processing_lease(),
    );

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/requests/{request_id}",
            get(routes::requests::get_request_status),
        )
        .route(
            "/api/v1/requests/{request_id}/trigger",
            post(routes::requests::trigger_request),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
