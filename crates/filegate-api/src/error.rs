use axum::Json;
use axum::response::{IntoResponse, Response};
use filegate_common::error::FilegateError;
use http::StatusCode;
use serde_json::json;

/// Boundary wrapper turning core errors into the JSON error envelope the
/// browser client expects.
pub struct ApiError(pub FilegateError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let status = match self.0 {
            FilegateError::SessionNotFound(_) | FilegateError::ObjectNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FilegateError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            FilegateError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            FilegateError::ChunkPersistFailure { .. }
            | FilegateError::FinalizeFailure(_)
            | FilegateError::ResourceReleaseFailure { .. }
            | FilegateError::InternalError(_)
            | FilegateError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "success": false,
            "message": message,
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<FilegateError> for ApiError {
    fn from(err: FilegateError) -> Self {
        ApiError(err)
    }
}
