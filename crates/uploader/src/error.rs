//! Upload error types.

use crate::types::ChunkRange;
use crate::ws_client::WsError;

/// Errors produced by the upload pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection error: {0}")]
    Connection(WsError),

    /// The server answered with an error envelope.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    /// Bad input on the client side; nothing was sent for it.
    #[error("invalid upload: {0}")]
    Validation(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    /// One range failed; the session stays open and the range may be retried.
    #[error("upload {upload_id}: chunk {range} failed: {source}")]
    ChunkFailed {
        upload_id: String,
        range: ChunkRange,
        source: Box<UploadError>,
    },

    #[error("upload task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    /// Wire error code, if the server rejected the request.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            Self::ChunkFailed { source, .. } => source.server_code(),
            _ => None,
        }
    }
}

impl From<WsError> for UploadError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Server { code, message } => Self::Server { code, message },
            other => Self::Connection(other),
        }
    }
}
