//! Listing, download and delete endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use filegate_common::path::normalize_key;
use filegate_store::traits::ObjectStore;
use http::StatusCode;
use http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::error::ApiError;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let files = state.store.list_dir(&query.path).await?;
    Ok(Json(json!({
        "success": true,
        "path": if query.path.is_empty() { "/" } else { &query.path },
        "files": files,
    })))
}

pub async fn download(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let key = normalize_key(&path)?;
    let (info, data) = state.store.get_object(&key).await?;

    let file_name = key.rsplit('/').next().unwrap_or(&key);
    let headers = [
        (CONTENT_TYPE, info.content_type.clone()),
        (CONTENT_LENGTH, info.size.to_string()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    Ok((StatusCode::OK, headers, data).into_response())
}

pub async fn delete(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = normalize_key(&path)?;
    state.store.delete_object(&key).await?;
    info!(key, "object deleted");
    Ok(Json(json!({ "success": true })))
}
