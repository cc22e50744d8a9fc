//! Chunked upload endpoints. The browser initiates a session, streams
//! numbered chunks as multipart form posts, and either sees the completion
//! response on the last chunk or aborts.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Query, State};
use bytes::Bytes;
use filegate_common::error::FilegateError;
use filegate_upload::ChunkOutcome;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub filename: String,
    pub total_parts: i32,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct AbortQuery {
    pub session_id: String,
}

pub async fn initiate(
    State(state): State<AppState>,
    payload: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    // A missing or malformed body is the client's fault, not a framework
    // detail; fold the rejection into the usual 400 envelope.
    let Json(req) = payload.map_err(|err| {
        FilegateError::InvalidArgument(format!("invalid initiate request: {}", err.body_text()))
    })?;
    let initiated = state
        .coordinator
        .initiate(&req.path, &req.filename, req.total_parts, req.file_size)
        .await?;

    Ok(Json(json!({
        "success": true,
        "session_id": initiated.session_id,
        "key": initiated.target_key,
        "total_parts": initiated.total_parts,
    })))
}

struct ChunkForm {
    session_id: String,
    part_number: i32,
    chunk: Bytes,
}

async fn read_chunk_form(mut form: Multipart) -> Result<ChunkForm, FilegateError> {
    let mut session_id = None;
    let mut part_number = None;
    let mut chunk = None;

    while let Some(field) = form
        .next_field()
        .await
        .map_err(|err| FilegateError::InvalidArgument(format!("malformed form body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("session_id") => {
                let value = field.text().await.map_err(|err| {
                    FilegateError::InvalidArgument(format!("unreadable session_id: {err}"))
                })?;
                session_id = Some(value);
            }
            Some("part_number") => {
                let value = field.text().await.map_err(|err| {
                    FilegateError::InvalidArgument(format!("unreadable part_number: {err}"))
                })?;
                let parsed = value.parse::<i32>().map_err(|_| {
                    FilegateError::InvalidArgument(format!("invalid part_number: {value}"))
                })?;
                part_number = Some(parsed);
            }
            Some("chunk") => {
                let data = field.bytes().await.map_err(|err| {
                    FilegateError::InvalidArgument(format!("unreadable chunk body: {err}"))
                })?;
                chunk = Some(data);
            }
            _ => {}
        }
    }

    Ok(ChunkForm {
        session_id: session_id
            .ok_or_else(|| FilegateError::InvalidArgument("missing session_id".to_string()))?,
        part_number: part_number
            .ok_or_else(|| FilegateError::InvalidArgument("missing part_number".to_string()))?,
        chunk: chunk
            .ok_or_else(|| FilegateError::InvalidArgument("missing chunk field".to_string()))?,
    })
}

pub async fn upload_chunk(
    State(state): State<AppState>,
    form: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_chunk_form(form).await?;
    let outcome = state
        .coordinator
        .receive_chunk(&form.session_id, form.part_number, form.chunk)
        .await?;

    let body = match outcome {
        ChunkOutcome::Progress {
            received,
            total,
            percent,
        } => json!({
            "success": true,
            "complete": false,
            "received": received,
            "total": total,
            "percent": percent,
        }),
        ChunkOutcome::Completed { path, size } => json!({
            "success": true,
            "complete": true,
            "path": path,
            "size": size,
        }),
    };
    Ok(Json(body))
}

pub async fn abort(
    State(state): State<AppState>,
    Query(query): Query<AbortQuery>,
) -> Result<Json<Value>, ApiError> {
    state.coordinator.abort(&query.session_id).await?;
    Ok(Json(json!({ "success": true })))
}
