use compose_gen::{
    config::AppConfig,
    db,
    services::{
        audit::AuditLog,
        completion::CompletionService,
        processor::{GenerationProcessor, JOB_TYPE_COMPOSE},
        provider::ProviderAdapter,
        queue::JobQueue,
        storage::R2Client,
        thumbnail::Thumbnailer,
        worker::{RateLimitConfig, WorkerOptions, WorkerPool},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How often abandoned `processing` jobs are reconciled.
const STUCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting compose-gen worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let config = Arc::new(config);

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");
    let storage = Arc::new(storage);

    let queue = JobQueue::new(&config.redis_url, JOB_TYPE_COMPOSE)
        .expect("Failed to initialize job queue");
    let queue = Arc::new(queue);

    // One bootstrap for every provider shape: the adapter is resolved from
    // configuration once, not per dispatch.
    let provider = ProviderAdapter::from_config(&config).expect("Failed to initialize provider");
    tracing::info!(provider = %provider.kind(), "Provider adapter resolved");

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
        Arc::clone(&thumbnailer),
        Arc::clone(&audit),
        config.retry_base_delay_ms,
    ));

    let processor = GenerationProcessor::new(
        db_pool.clone(),
        Arc::clone(&storage),
        provider,
        thumbnailer,
        Arc::clone(&audit),
        config.retry_base_delay_ms,
    );

    // Reconciliation sweep for jobs stuck in `processing`
    {
        let completion = Arc::clone(&completion);
        let max_age = config.stuck_job_max_age_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STUCK_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match completion.sweep_stuck(max_age).await {
                    Ok(0) => {}
                    Ok(swept) => tracing::warn!(swept, "reconciled stuck processing jobs"),
                    Err(e) => tracing::error!(error = %e, "stuck job sweep failed"),
                }
            }
        });
    }

    let options = WorkerOptions {
        concurrency: config.worker_concurrency,
        rate_limit: Some(RateLimitConfig {
            max: config.rate_limit_max,
            window: Duration::from_secs(config.rate_limit_window_secs),
        }),
        lease: Duration::from_secs(config.stall_timeout_secs),
        ..WorkerOptions::default()
    };

    tracing::info!(
        concurrency = options.concurrency,
        rate_limit_max = config.rate_limit_max,
        rate_limit_window_secs = config.rate_limit_window_secs,
        "Worker ready, starting job processing loop"
    );

    let pool = WorkerPool::new(queue, options);
    pool.run(Arc::new(processor), shutdown_signal()).await;

    tracing::info!("Worker stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
