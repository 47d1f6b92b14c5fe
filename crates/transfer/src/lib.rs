//! Upload session lifecycle: offset-addressed chunk writes into a pending
//! artifact, checksum-gated promotion and TTL-based garbage collection.

mod chunked;
mod finish;
mod reaper;
mod service;
mod storage;
mod store;
mod types;
mod validation;

use std::sync::Arc;

use chunkup_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CHECKSUM_MISMATCH, WS_ERR_CODE_CONFLICT,
    WS_ERR_CODE_INTERNAL, WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_RANGE,
};

pub use chunked::{ChunkReceipt, ChunkWriter, checksum_bytes, checksum_reader};
pub use finish::Finisher;
pub use reaper::{Reaper, SweepReport};
pub use service::{ServiceOptions, UploadService};
pub use storage::{Entry, LocalStorage, MemoryStorage, Storage};
pub use store::{RecoveryReport, SessionStore};
pub use types::{SessionRecord, SessionSnapshot, SessionState, artifact_path, record_path, session_dir};
pub use validation::{validate_destination, validate_upload_path};

/// Default chunk size used by clients: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Reserved directory (relative to the storage root) holding in-progress uploads.
pub const PENDING_DIR: &str = ".pending";

/// Failure category, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Range,
    Io,
    ChecksumMismatch,
}

/// Errors produced by the transfer crate.
///
/// `Clone` so a single finish outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("out of range: {0}")]
    Range(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Range(_) => ErrorKind::Range,
            Self::Io(_) => ErrorKind::Io,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
        }
    }

    /// Error code carried in the wire envelope.
    pub fn code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => WS_ERR_CODE_BAD_REQUEST,
            ErrorKind::NotFound => WS_ERR_CODE_NOT_FOUND,
            ErrorKind::Conflict => WS_ERR_CODE_CONFLICT,
            ErrorKind::Range => WS_ERR_CODE_RANGE,
            ErrorKind::Io => WS_ERR_CODE_INTERNAL,
            ErrorKind::ChecksumMismatch => WS_ERR_CODE_CHECKSUM_MISMATCH,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(Arc::new(e.into()))
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Io(Arc::new(std::io::Error::other(e)))
    }
}
