//! WebSocket server for chunked uploads.
//!
//! Accepts any number of client connections, dispatches JSON and binary
//! messages to a [`Handler`] trait, and manages each connection's lifecycle
//! (ping/pong, graceful shutdown). Every inbound message runs on its own
//! task so chunk writes from one connection proceed concurrently.

mod connection;
mod handler;
mod server;

pub use connection::{ClientConnection, ConnMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};

/// Send buffer capacity per connection.
///
/// Every in-flight chunk produces one response; the buffer must hold a
/// burst of them while the write pump is busy with a large frame.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server already running")]
    AlreadyRunning,
}
