use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    audit::AuditLog, completion::CompletionService, queue::JobQueue, storage::R2Client,
};

/// Shared application context, built once at process start and passed
/// explicitly to route handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: PgPool,
    pub storage: Arc<R2Client>,
    pub queue: Arc<JobQueue>,
    pub completion: Arc<CompletionService>,
    pub audit: Arc<AuditLog>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        db: PgPool,
        storage: Arc<R2Client>,
        queue: Arc<JobQueue>,
        completion: Arc<CompletionService>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            db,
            storage,
            queue,
            completion,
            audit,
        }
    }
}
