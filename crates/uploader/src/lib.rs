//! Client side of chunked uploads.
//!
//! [`ChunkedUploader`] drives the whole pipeline against any
//! [`UploadConnection`]: create a session, stream the source in fixed-size
//! ranges through a bounded worker pool, and finish with a checksum computed
//! from the local bytes in file order. [`WsClient`] is the WebSocket
//! implementation of the connection.
//!
//! # Pipeline
//!
//! 1. **Create** — open a session, optionally declaring the total size
//! 2. **Upload** — read the source sequentially, hash it, and dispatch each
//!    range concurrently
//! 3. **Finish** — send the whole-file checksum and receive the final path

pub mod connection;
pub mod error;
mod pumps;
pub mod types;
pub mod uploader;
pub mod ws_client;

pub use connection::{ConnFuture, UploadConnection};
pub use error::UploadError;
pub use types::{ChunkRange, UploadEvent, UploadOptions, UploadOutcome};
pub use uploader::{ChunkedUploader, partition};
pub use ws_client::{WsClient, WsError};

/// Default chunk size used when the caller does not pick one (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default number of chunks in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 4;
