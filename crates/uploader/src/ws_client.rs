//! WebSocket client for an upload server.
//!
//! Implements request-response correlation by UUID and ping/pong keepalive.
//! Text requests and binary chunks share one connection; responses are
//! matched back to their request through the pending map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chunkup_protocol::binary::{ChunkHeader, encode_chunk_frame};
use chunkup_protocol::constants::{
    MessageType, WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use chunkup_protocol::envelope::Message;

use crate::connection::{ConnFuture, UploadConnection};
use crate::pumps::{self, PendingMap};

/// Errors from the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
}

/// WebSocket client connected to one upload server.
pub struct WsClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    request_timeout: Duration,
    chunk_timeout: Duration,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl WsClient {
    /// Connects to an upload server, e.g. `ws://127.0.0.1:8081`.
    pub async fn connect(url: &str) -> Result<Self, WsError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();
        tracing::debug!(%url, "connected to upload server");

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(pumps::ping::ping_pump(write_tx.clone(), cancel.clone()));

        Ok(Self {
            write_tx,
            pending,
            request_timeout: WS_REQUEST_TIMEOUT,
            chunk_timeout: WS_BINARY_REQUEST_TIMEOUT,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        })
    }

    /// Overrides the text and binary request timeouts.
    pub fn with_timeouts(mut self, request: Duration, chunk: Duration) -> Self {
        self.request_timeout = request;
        self.chunk_timeout = chunk;
        self
    }

    /// Returns `true` while the read pump is alive.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Sends a request and waits for the correlated response.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, WsError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.round_trip(id, tungstenite::Message::Text(json.into()), self.request_timeout)
            .await
    }

    /// Sends one chunk as `[u32 BE len][JSON header][data]` and waits for the ack.
    ///
    /// A fresh UUID replaces `header.id` for correlation.
    pub async fn send_binary(
        &self,
        mut header: ChunkHeader,
        data: &[u8],
    ) -> Result<Message, WsError> {
        let id = uuid::Uuid::new_v4().to_string();
        header.id = id.clone();
        let frame = encode_chunk_frame(&header, data)?;
        self.round_trip(id, tungstenite::Message::Binary(frame.into()), self.chunk_timeout)
            .await
    }

    async fn round_trip(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, WsError> {
        if !self.is_connected() {
            return Err(WsError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(WsError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(WsError::Server {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(WsError::Closed),
            Err(_) => Err(WsError::Timeout),
        }
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl UploadConnection for WsClient {
    fn send_request(&self, msg_type: MessageType, payload: serde_json::Value) -> ConnFuture<'_> {
        Box::pin(async move { Ok(WsClient::send_request(self, msg_type, Some(&payload)).await?) })
    }

    fn send_chunk<'a>(&'a self, header: ChunkHeader, data: &'a [u8]) -> ConnFuture<'a> {
        Box::pin(async move { Ok(self.send_binary(header, data).await?) })
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}
