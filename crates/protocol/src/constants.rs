use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline on both ends. Set high enough to tolerate slow
/// disk I/O while a large chunk is being written or an artifact is hashed.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (64 MB).
///
/// Must exceed the largest accepted chunk plus its binary header.
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Timeout for request/response operations (text messages).
///
/// `finish_upload` hashes the whole artifact before replying, so this is
/// generous compared to a plain RPC timeout.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for binary request/response operations (chunk uploads).
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "create_upload")]
    CreateUpload,
    #[serde(rename = "finish_upload")]
    FinishUpload,
    #[serde(rename = "rename_upload")]
    RenameUpload,
    #[serde(rename = "get_upload")]
    GetUpload,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "upload_created")]
    UploadCreated,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "upload_finished")]
    UploadFinished,
    #[serde(rename = "upload_info")]
    UploadInfo,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Malformed input: missing id, negative size, oversized chunk, bad path.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
/// Unknown upload session.
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
/// Operation not valid for the session's current state.
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
/// Chunk would exceed the declared size.
pub const WS_ERR_CODE_RANGE: i32 = 416;
/// Whole-file checksum did not match; the session is gone.
pub const WS_ERR_CODE_CHECKSUM_MISMATCH: i32 = 422;
/// Storage failure; safe to retry.
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::CreateUpload).unwrap(),
            "\"create_upload\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::UploadChunkResponse).unwrap(),
            "\"upload_chunk_response\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::FinishUpload).unwrap(),
            "\"finish_upload\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"rename_upload\"").unwrap();
        assert_eq!(mt, MessageType::RenameUpload);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"cancel_everything\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn max_message_size_fits_default_chunk() {
        // 50 MiB chunk + header must fit in a single frame.
        assert!(WS_MAX_MESSAGE_SIZE > 50 * 1024 * 1024 + 4096);
    }
}
