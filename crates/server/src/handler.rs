//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload logic while the server framework handles
//! connection management, routing, and the binary chunk framing.

use std::future::Future;
use std::pin::Pin;

use chunkup_protocol::binary::ChunkHeader;
use chunkup_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use chunkup_protocol::envelope::Message;

use crate::connection::{ConnMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket messages from upload clients.
///
/// The server dispatches parsed messages to the appropriate method, each on
/// its own task. Each method receives:
/// - `sender`: channel to send the response back to the requesting client
/// - `msg`: the parsed JSON envelope (for text) or the chunk header and bytes
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) =
                msg.reply(chunkup_protocol::MessageType::Pong, Option::<&()>::None)
            {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `create_upload`.
    fn on_create_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `finish_upload`.
    fn on_finish_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `rename_upload`.
    fn on_rename_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `get_upload`.
    fn on_get_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for a binary upload chunk.
    fn on_binary_chunk(&self, sender: Sender, header: ChunkHeader, data: Vec<u8>) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            tracing::warn!("binary chunk received but handler not implemented");
            let _ = sender.send_error_for(&header.id, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called when a client disconnects (cleanup hook).
    fn on_disconnected(&self, meta: ConnMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }
}
