use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilegateError {
    #[error("upload session not found: {0}")]
    SessionNotFound(String),
    #[error("failed to persist part {part_number}: {reason}")]
    ChunkPersistFailure { part_number: i32, reason: String },
    #[error("failed to finalize upload: {0}")]
    FinalizeFailure(String),
    #[error("failed to release backing resource for {upload_id}: {reason}")]
    ResourceReleaseFailure { upload_id: String, reason: String },
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FilegateError {
    /// Recoverable errors preserve the upload session so the client can
    /// retry the failed step instead of restarting from the first chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChunkPersistFailure { .. } | Self::FinalizeFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FilegateError>;
