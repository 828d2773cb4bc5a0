mod app_state;
mod config;
mod db;
mod models;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::{
    audit::AuditLog, completion::CompletionService, processor::JOB_TYPE_COMPOSE, queue::JobQueue,
    storage::R2Client, thumbnail::Thumbnailer,
};

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
    let config = Arc::new(config);

    tracing::info!("Initializing compose-gen API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("composegen_jobs_enqueued", "Total jobs accepted for generation");
    metrics::describe_counter!("composegen_jobs_started", "Total job deliveries started");
    metrics::describe_counter!("composegen_jobs_completed", "Total job deliveries completed");
    metrics::describe_counter!("composegen_jobs_failed", "Total jobs that failed permanently");
    metrics::describe_counter!("composegen_jobs_stalled", "Queue entries requeued after a lease expired");
    metrics::describe_counter!("composegen_jobs_swept", "Stuck processing jobs failed by the reconciliation sweep");
    metrics::describe_histogram!(
        "composegen_job_processing_seconds",
        "Time spent processing one job delivery"
    );
    metrics::describe_gauge!(
        "composegen_queue_depth",
        "Deliverable entries currently waiting in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize R2 storage client
    tracing::info!("Initializing R2 storage client");
    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");
    let storage = Arc::new(storage);

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url, JOB_TYPE_COMPOSE)
        .expect("Failed to initialize job queue");
    let queue = Arc::new(queue);

    let audit = Arc::new(AuditLog::new(db_pool.clone()));
    let thumbnailer = Arc::new(Thumbnailer::new(
        db_pool.clone(),
        Arc::clone(&storage),
        config.thumbnail_sizes.clone(),
    ));
    let completion = Arc::new(CompletionService::new(
        db_pool.clone(),
        Arc::clone(&storage),
        Arc::clone(&queue),
        thumbnailer,
        Arc::clone(&audit),
        config.retry_base_delay_ms,
    ));

    // Create shared application state
    let state = AppState::new(
        Arc::clone(&config),
        db_pool,
        storage,
        Arc::clone(&queue),
        completion,
        audit,
    );

    // Keep the queue depth gauge fresh
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                match queue.metrics().await {
                    Ok(m) => {
                        metrics::gauge!("composegen_queue_depth")
                            .set((m.waiting + m.delayed + m.paused) as f64);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to sample queue depth"),
                }
            }
        });
    }

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/generations", post(routes::generate::submit_generation))
        .route("/api/v1/generations/{id}", get(routes::generate::get_job_status))
        .route(
            "/api/v1/generations/{id}/cancel",
            post(routes::generate::cancel_generation),
        )
        .route(
            "/api/v1/generations/stats/{user_id}",
            get(routes::generate::user_stats),
        )
        .route("/api/v1/queue/stats", get(routes::generate::queue_stats))
        .route(
            "/api/v1/webhooks/generation",
            post(routes::webhook::provider_callback),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024)); // 2 MB limit

    tracing::info!("Starting compose-gen on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
