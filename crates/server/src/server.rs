//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades incoming connections to WebSocket, and
//! serves any number of clients at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use chunkup_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, ClientConnection, ConnMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

/// The upload WebSocket server.
///
/// Tracks every live connection and dispatches their messages to the
/// provided [`Handler`].
pub struct UploadServer<H: Handler> {
    port: u16,
    handler: Arc<H>,
    connections: Mutex<HashMap<u64, ClientConnection>>,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    /// Creates a server around a handler the caller also keeps.
    pub fn with_shared_handler(config: ServerConfig, handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            handler,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of live client connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Closes every client connection.
    pub async fn disconnect_all(&self) {
        let mut lock = self.connections.lock().await;
        for (_, conn) in lock.drain() {
            conn.close();
        }
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    ///
    /// Binds to the configured port and accepts WebSocket connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.local_addr.lock().await.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.disconnect_all().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: upgrades to WS and tracks it until it closes.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(conn = id, %peer_addr, "WebSocket connection established");

        let meta = ConnMeta {
            id,
            remote_addr: peer_addr.to_string(),
        };
        let conn = connection::spawn_connection(
            ws_stream,
            meta,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        let closed = conn.closed_token();
        self.connections.lock().await.insert(id, conn);

        closed.cancelled().await;
        self.connections.lock().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use chunkup_protocol::binary::{ChunkHeader, encode_chunk_frame};
    use chunkup_protocol::envelope::Message;
    use chunkup_protocol::MessageType;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::connection::Sender;
    use crate::handler::HandlerFuture;

    /// Minimal test handler.
    #[derive(Default)]
    struct TestHandler {
        created: AtomicUsize,
        chunk_bytes: AtomicUsize,
    }

    impl Handler for TestHandler {
        fn on_create_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.created.fetch_add(1, Ordering::SeqCst);
                let reply = msg
                    .reply(MessageType::UploadCreated, Some(&serde_json::json!({"uploadId": "u-1"})))
                    .unwrap();
                let _ = sender.send_msg(reply);
            })
        }

        fn on_binary_chunk(&self, sender: Sender, header: ChunkHeader, data: Vec<u8>) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.chunk_bytes.fetch_add(data.len(), Ordering::SeqCst);
                let reply = Message::new(
                    header.id,
                    MessageType::UploadChunkResponse,
                    Some(&serde_json::json!({"uploadId": header.upload_id, "offset": 0, "bytesWritten": data.len()})),
                )
                .unwrap();
                let _ = sender.send_msg(reply);
            })
        }
    }

    async fn start() -> (Arc<UploadServer<TestHandler>>, tokio::task::JoinHandle<()>, String) {
        let server = UploadServer::new(ServerConfig { port: 0 }, TestHandler::default());
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        for _ in 0..100 {
            if server.port().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        (server, handle, url)
    }

    async fn next_text<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = start().await;
        assert!(server.port().await > 0, "should have bound to a dynamic port");
        assert_eq!(server.connection_count().await, 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_accepts_many_connections() {
        let (server, handle, url) = start().await;

        let (_ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (_ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (ws3, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connection_count().await, 3);

        drop(ws3);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connection_count().await, 2);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_dispatches_text_message() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let msg = serde_json::json!({"id": "test-1", "type": "create_upload", "payload": {}});
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();

        let reply = next_text(&mut ws).await;
        assert_eq!(reply.id, "test-1");
        assert_eq!(reply.msg_type, MessageType::UploadCreated);
        assert_eq!(server.handler.created.load(Ordering::SeqCst), 1);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_dispatches_binary_chunk() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let header = ChunkHeader {
            id: "c-1".into(),
            upload_id: "u-1".into(),
            offset: Some(0),
            compute_hash: false,
        };
        let frame = encode_chunk_frame(&header, &[7u8; 300]).unwrap();
        ws.send(WsMessage::Binary(frame.into())).await.unwrap();

        let reply = next_text(&mut ws).await;
        assert_eq!(reply.id, "c-1");
        assert_eq!(reply.msg_type, MessageType::UploadChunkResponse);
        assert_eq!(server.handler.chunk_bytes.load(Ordering::SeqCst), 300);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_and_unimplemented_messages_get_errors() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let msg = serde_json::json!({"id": "x-1", "type": "launch_rockets"});
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
        let reply = next_text(&mut ws).await;
        assert_eq!(reply.id, "x-1");
        assert_eq!(reply.error.unwrap().code, 501);

        let msg = serde_json::json!({"id": "x-2", "type": "get_upload", "payload": {"uploadId": "u"}});
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
        let reply = next_text(&mut ws).await;
        assert_eq!(reply.id, "x-2");
        assert_eq!(reply.error.unwrap().code, 501);

        let msg = serde_json::json!({"id": "x-3", "type": "ping"});
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
        let reply = next_text(&mut ws).await;
        assert_eq!(reply.msg_type, MessageType::Pong);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let (server, handle, _) = start().await;
        let err = server.run().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning));
        server.shutdown();
        handle.await.unwrap();
    }
}
