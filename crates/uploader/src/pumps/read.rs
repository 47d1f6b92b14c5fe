//! WebSocket read pump — routes responses to waiting requests.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chunkup_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use chunkup_protocol::envelope::Message;

use super::PendingMap;

/// Reads messages from the WebSocket until it closes or goes silent.
///
/// Any incoming frame resets the deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the connection is treated as dead. On exit the cancel
/// token fires and every pending request is dropped so its caller sees
/// the connection as closed.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("pong timeout, closing connection");
                break;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => handle_text_message(&text, &pending).await,
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("received close frame");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    pending.lock().await.clear();
}

/// Delivers a text response to the request waiting on its id.
async fn handle_text_message(text: &str, pending: &PendingMap) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");
    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => warn!(msg_type = ?msg.msg_type, id = %msg.id, "response for unknown request"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use chunkup_protocol::constants::MessageType;
    use futures_util::stream;
    use tokio::sync::{Mutex, oneshot};

    fn pending_map() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn routes_response_to_pending() {
        let pending = pending_map();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let msg = Message::new::<()>("req-1", MessageType::Pong, None).unwrap();
        handle_text_message(&serde_json::to_string(&msg).unwrap(), &pending).await;

        let got = rx.await.unwrap();
        assert_eq!(got.id, "req-1");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stream_end_drops_waiters_and_cancels() {
        let pending = pending_map();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();
        read_pump(empty, pending, write_tx, cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(rx.await.is_err(), "waiter should see the connection closed");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(silent, pending_map(), write_tx, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let cancel = CancellationToken::new();
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![1, 2].into()))]);

        read_pump(frames, pending_map(), write_tx, cancel).await;
        let reply = write_rx.recv().await.unwrap();
        assert_eq!(reply, tungstenite::Message::Pong(vec![1, 2].into()));
    }
}
