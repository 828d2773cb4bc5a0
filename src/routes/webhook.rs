use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::completion::{CallbackDisposition, ProviderCallback};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

/// POST /api/v1/webhooks/generation — inbound provider completion.
///
/// Providers retry deliveries, so unknown and already-settled task ids are
/// acknowledged with 200 rather than errored; only an internal fault (which
/// a later redelivery may get past) returns 5xx.
pub async fn provider_callback(
    State(state): State<AppState>,
    Json(callback): Json<ProviderCallback>,
) -> Result<Json<WebhookAck>, StatusCode> {
    match state.completion.handle_callback(&callback).await {
        Ok(disposition) => {
            let status = match disposition {
                CallbackDisposition::Orphaned => "ignored",
                CallbackDisposition::Duplicate => "duplicate",
                CallbackDisposition::Busy => "in_progress",
                CallbackDisposition::Succeeded | CallbackDisposition::Failed => "ok",
            };
            Ok(Json(WebhookAck { status }))
        }
        Err(e) => {
            tracing::error!(
                task_id = %callback.task_id,
                error = %e,
                "provider callback reconciliation failed"
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
