//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use chunkup_protocol::binary::parse_chunk_frame;
use chunkup_protocol::constants::{
    MessageType, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use chunkup_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Metadata about a connected client.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    /// Server-local connection number.
    pub id: u64,
    pub remote_addr: String,
}

/// Handle for sending messages to a connected client.
///
/// Cloneable and cheap, wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the channel is full or closed.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Sends an error response correlated by request id only (binary requests).
    pub fn send_error_for(&self, id: &str, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(Message::error(id, code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a client.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct ClientConnection {
    pub meta: ConnMeta,
    sender: Sender,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled once the connection has stopped, for any reason.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the [`ClientConnection`] handle. The pumps run as background
/// tokio tasks and stop when the connection is closed or the cancel
/// token is triggered.
pub(crate) fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ConnMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let conn = ClientConnection {
        meta: meta.clone(),
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    // Read pump.
    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, sender, handler.clone(), read_cancel.clone()).await;
        // When read pump exits, cancel the write pump too.
        read_cancel.cancel();
        handler.on_disconnected(meta.clone()).await;
        tracing::info!(conn = meta.id, remote = %meta.remote_addr, "client disconnected");
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches each to the handler on its own task.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                // Any inbound traffic proves the peer is alive.
                got_pong = true;
                match frame {
                    Some(Ok(ws_msg)) => match ws_msg {
                        WsMessage::Text(text) => {
                            if text.len() > WS_MAX_MESSAGE_SIZE {
                                tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                continue;
                            }
                            dispatch_text(&handler, &sender, text.as_str());
                        }
                        WsMessage::Binary(data) => {
                            if data.len() > WS_MAX_MESSAGE_SIZE {
                                tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                continue;
                            }
                            dispatch_binary(&handler, &sender, &data);
                        }
                        WsMessage::Pong(_) => {
                            pong_deadline.reset();
                        }
                        WsMessage::Ping(data) => {
                            let _ = sender.tx.try_send(WsMessage::Pong(data));
                        }
                        WsMessage::Close(_) => {
                            tracing::info!("received close frame");
                            break;
                        }
                        WsMessage::Frame(_) => {} // Raw frames ignored.
                    },
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Parses a text (JSON) message and spawns the matching handler method.
fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    let handler = Arc::clone(handler);
    let s = sender.clone();
    tokio::spawn(async move {
        match msg.msg_type {
            MessageType::Ping => handler.on_ping(s, msg).await,
            MessageType::CreateUpload => handler.on_create_upload(s, msg).await,
            MessageType::FinishUpload => handler.on_finish_upload(s, msg).await,
            MessageType::RenameUpload => handler.on_rename_upload(s, msg).await,
            MessageType::GetUpload => handler.on_get_upload(s, msg).await,
            _ => {
                tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
                let _ = s.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
            }
        }
    });
}

/// Parses a binary WebSocket frame and spawns the chunk handler.
fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_chunk_frame(data) {
        Ok((header, payload)) => {
            let handler = Arc::clone(handler);
            let s = sender.clone();
            tokio::spawn(async move { handler.on_binary_chunk(s, header, payload).await });
        }
        Err(e) => {
            // No request id to answer to.
            tracing::error!("failed to parse binary message: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn send_error_for_correlates_by_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = Sender { tx };
        sender.send_error_for("chunk-7", 416, "too far").unwrap();

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let msg: Message = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(msg.id, "chunk-7");
        assert_eq!(msg.msg_type, MessageType::Error);
        assert_eq!(msg.error.unwrap().code, 416);
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender { tx };
        assert!(sender.is_connected());
        drop(rx);
        assert!(!sender.is_connected());
        assert!(sender.send_error_for("x", 500, "gone").is_err());
    }
}
