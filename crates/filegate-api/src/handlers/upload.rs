//! Single-shot upload and presigned-URL endpoints for files small enough
//! to skip the chunked path.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use bytes::Bytes;
use filegate_common::error::FilegateError;
use filegate_common::path::{object_key, unique_object_key};
use filegate_store::traits::ObjectStore;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::error::ApiError;
use crate::router::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictAction {
    Rename,
    Replace,
}

impl ConflictAction {
    fn parse(value: &str) -> Result<Self, FilegateError> {
        match value {
            "rename" => Ok(Self::Rename),
            "replace" => Ok(Self::Replace),
            other => Err(FilegateError::InvalidArgument(format!(
                "unknown conflict action: {other}"
            ))),
        }
    }
}

struct UploadForm {
    file_name: String,
    content_type: Option<String>,
    data: Bytes,
    path: String,
    conflict_action: ConflictAction,
}

async fn read_upload_form(mut form: Multipart) -> Result<UploadForm, FilegateError> {
    let mut file = None;
    let mut path = String::new();
    let mut conflict_action = ConflictAction::Rename;

    while let Some(field) = form
        .next_field()
        .await
        .map_err(|err| FilegateError::InvalidArgument(format!("malformed form body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        FilegateError::InvalidArgument("file field has no filename".to_string())
                    })?;
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|err| {
                    FilegateError::InvalidArgument(format!("unreadable file body: {err}"))
                })?;
                file = Some((file_name, content_type, data));
            }
            Some("path") => {
                path = field.text().await.map_err(|err| {
                    FilegateError::InvalidArgument(format!("unreadable path: {err}"))
                })?;
            }
            Some("conflict_action") => {
                let value = field.text().await.map_err(|err| {
                    FilegateError::InvalidArgument(format!("unreadable conflict_action: {err}"))
                })?;
                conflict_action = ConflictAction::parse(&value)?;
            }
            _ => {}
        }
    }

    let (file_name, content_type, data) = file
        .ok_or_else(|| FilegateError::InvalidArgument("missing file field".to_string()))?;
    Ok(UploadForm {
        file_name,
        content_type,
        data,
        path,
        conflict_action,
    })
}

pub async fn upload(
    State(state): State<AppState>,
    form: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_upload_form(form).await?;
    let key = object_key(&form.path, &form.file_name)?;

    // Name collisions are resolved before the write, not by overwriting.
    let (key, renamed) = match state.store.stat_object(&key).await {
        Ok(_) => match form.conflict_action {
            ConflictAction::Rename => (unique_object_key(&key), true),
            ConflictAction::Replace => (key, false),
        },
        Err(FilegateError::ObjectNotFound(_)) => (key, false),
        Err(err) => return Err(err.into()),
    };

    let info = state
        .store
        .put_object(&key, form.data, form.content_type.as_deref())
        .await?;
    info!(key, size = info.size, renamed, "single-shot upload stored");

    Ok(Json(json!({
        "success": true,
        "path": format!("/{key}"),
        "size": info.size,
        "renamed": renamed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub filename: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_presign_expiry")]
    pub expires_secs: u64,
}

fn default_presign_expiry() -> u64 {
    900
}

pub async fn presign(
    State(state): State<AppState>,
    payload: Result<Json<PresignRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload.map_err(|err| {
        FilegateError::InvalidArgument(format!("invalid presign request: {}", err.body_text()))
    })?;
    let key = object_key(&req.path, &req.filename)?;
    let url = state.store.presign_put(&key, req.expires_secs).await?;

    Ok(Json(json!({
        "success": true,
        "url": url,
        "key": key,
        "expires_secs": req.expires_secs,
    })))
}
