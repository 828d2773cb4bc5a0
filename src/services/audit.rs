use sqlx::PgPool;

/// An audit record. Details are free-form JSON.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: String,
    pub event_type: String,
    pub action: String,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub is_success: bool,
}

/// Fire-and-forget audit sink.
///
/// Recording must never fail the job it describes: the insert runs on a
/// detached task and failures are only logged.
pub struct AuditLog {
    db: PgPool,
}

impl AuditLog {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn record(&self, event: AuditEvent) {
        let db = self.db.clone();
        tokio::spawn(async move {
            let result = sqlx::query(
                r#"
                INSERT INTO audit_log (user_id, event_type, action, resource_id, details, is_success)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&event.user_id)
            .bind(&event.event_type)
            .bind(&event.action)
            .bind(&event.resource_id)
            .bind(&event.details)
            .bind(event.is_success)
            .execute(&db)
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    error = %e,
                    event_type = %event.event_type,
                    action = %event.action,
                    "failed to record audit event"
                );
            }
        });
    }
}
