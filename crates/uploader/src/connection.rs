//! Connection trait the upload pipeline talks through.
//!
//! [`WsClient`](crate::WsClient) implements it over WebSocket. Keeping the
//! pipeline behind a trait makes it transport-agnostic and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use chunkup_protocol::binary::ChunkHeader;
use chunkup_protocol::constants::MessageType;
use chunkup_protocol::envelope::Message;

use crate::error::UploadError;

/// Boxed future returned by [`UploadConnection`] methods.
pub type ConnFuture<'a> = Pin<Box<dyn Future<Output = Result<Message, UploadError>> + Send + 'a>>;

/// Abstract connection to an upload server.
pub trait UploadConnection: Send + Sync {
    /// Sends a JSON request and waits for the response.
    ///
    /// Error envelopes are returned as [`UploadError::Server`].
    fn send_request(&self, msg_type: MessageType, payload: serde_json::Value) -> ConnFuture<'_>;

    /// Sends one chunk as a binary frame and waits for its acknowledgement.
    ///
    /// The implementation owns request correlation and overwrites `header.id`.
    fn send_chunk<'a>(&'a self, header: ChunkHeader, data: &'a [u8]) -> ConnFuture<'a>;
}
