//! Data types for the upload pipeline.

use std::fmt;

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY};

/// A half-open byte range `[offset, offset + len)` of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: u64,
}

impl ChunkRange {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Options for one upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Bytes per chunk; the last chunk carries the remainder.
    pub chunk_size: usize,
    /// Chunks in flight at once. `1` uploads sequentially.
    pub concurrency: usize,
    /// Declare the total size at create time. Without it the session runs in
    /// append mode and chunks are sent one at a time in file order.
    pub declare_size: bool,
    /// Final location, relative to the server's storage root.
    pub target_path: Option<String>,
    /// Ask the server for a per-chunk hash and compare it with the local one.
    pub compute_chunk_hash: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            declare_size: true,
            target_path: None,
            compute_chunk_hash: false,
        }
    }
}

/// Progress event emitted during an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// The server opened a session.
    Created { upload_id: String, total_bytes: u64 },
    /// One range was acknowledged.
    ChunkSent {
        upload_id: String,
        range: ChunkRange,
        /// Bytes acknowledged so far, this range included.
        sent_bytes: u64,
        total_bytes: u64,
    },
    /// Every range is stored; verification has started.
    Finishing { upload_id: String },
    /// The server verified and stored the file.
    Completed { upload_id: String, path: String },
    /// The upload stopped with an error.
    Failed {
        upload_id: Option<String>,
        error: String,
    },
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub upload_id: String,
    /// Path the server stored the file at.
    pub path: String,
    /// Lowercase hex SHA-256 of the source.
    pub checksum: String,
    pub bytes: u64,
}
