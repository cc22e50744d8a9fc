//! Storage usage endpoint backed by the TTL cache.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let (snapshot, cached, age) = state.stats.get(query.refresh).await?;
    Ok(Json(json!({
        "success": true,
        "cached": cached,
        "cache_age_secs": age.as_secs(),
        "stats": snapshot,
    })))
}
