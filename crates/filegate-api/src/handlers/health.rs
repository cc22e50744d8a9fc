use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use filegate_store::traits::ObjectStore;
use http::StatusCode;
use serde_json::json;
use tracing::warn;

use crate::router::AppState;

/// Probes the backing store with a root listing. Degraded storage answers
/// 503 so load balancers can rotate the instance out.
pub async fn health(State(state): State<AppState>) -> Response {
    let active_sessions = state.coordinator.registry().len();
    match state.store.list_dir("").await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "active_sessions": active_sessions,
            })),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "health probe against backing store failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "message": err.to_string(),
                    "active_sessions": active_sessions,
                })),
            )
                .into_response()
        }
    }
}
