//! Upload message handler: maps wire requests onto the upload service.

use std::sync::Arc;

use chunkup_protocol::binary::ChunkHeader;
use chunkup_protocol::constants::{MessageType, WS_ERR_CODE_BAD_REQUEST};
use chunkup_protocol::envelope::Message;
use chunkup_protocol::messages::{
    CreateUploadRequest, CreateUploadResponse, FinishUploadRequest, FinishUploadResponse,
    GetUploadRequest, OperationResult, RenameUploadRequest, UploadChunkResponse,
};
use chunkup_server::{ConnMeta, Handler, HandlerFuture, Sender};
use chunkup_transfer::{TransferError, UploadService};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serves upload requests from every connection against one service.
pub struct UploadHandler {
    service: Arc<UploadService>,
}

impl UploadHandler {
    pub fn new(service: Arc<UploadService>) -> Self {
        Self { service }
    }
}

/// Parses a required payload, answering 400 when it is missing or malformed.
fn parse_request<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(r)) => Some(r),
        Ok(None) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, "missing payload");
            None
        }
        Err(e) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, &format!("invalid payload: {e}"));
            None
        }
    }
}

fn reply<T: Serialize>(sender: &Sender, msg: &Message, msg_type: MessageType, payload: &T) {
    match msg.reply(msg_type, Some(payload)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => tracing::error!("failed to build reply: {e}"),
    }
}

fn reply_transfer_error(sender: &Sender, msg: &Message, err: &TransferError) {
    let _ = sender.send_error(msg, err.code(), &err.to_string());
}

impl Handler for UploadHandler {
    fn on_create_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            // An empty payload opens an append-mode session.
            let req = match msg.parse_payload::<CreateUploadRequest>() {
                Ok(r) => r.unwrap_or_default(),
                Err(e) => {
                    let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, &format!("invalid payload: {e}"));
                    return;
                }
            };

            match self.service.create(req.declared_size, req.target_path).await {
                Ok(upload_id) => {
                    reply(&sender, &msg, MessageType::UploadCreated, &CreateUploadResponse { upload_id });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "create upload rejected");
                    reply_transfer_error(&sender, &msg, &e);
                }
            }
        })
    }

    fn on_finish_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<FinishUploadRequest>(&sender, &msg) else {
                return;
            };

            match self
                .service
                .finish(&req.upload_id, &req.checksum, req.target_path)
                .await
            {
                Ok(path) => {
                    let resp = FinishUploadResponse {
                        upload_id: req.upload_id,
                        path,
                    };
                    reply(&sender, &msg, MessageType::UploadFinished, &resp);
                }
                Err(e) => reply_transfer_error(&sender, &msg, &e),
            }
        })
    }

    fn on_rename_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<RenameUploadRequest>(&sender, &msg) else {
                return;
            };

            match self.service.rename(&req.upload_id, &req.path).await {
                Ok(()) => {
                    let resp = OperationResult {
                        success: true,
                        message: String::new(),
                    };
                    reply(&sender, &msg, MessageType::OperationResult, &resp);
                }
                Err(e) => reply_transfer_error(&sender, &msg, &e),
            }
        })
    }

    fn on_get_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<GetUploadRequest>(&sender, &msg) else {
                return;
            };

            match self.service.get(&req.upload_id).await {
                Ok(snapshot) => reply(&sender, &msg, MessageType::UploadInfo, &snapshot.to_info()),
                Err(e) => reply_transfer_error(&sender, &msg, &e),
            }
        })
    }

    fn on_binary_chunk(&self, sender: Sender, header: ChunkHeader, data: Vec<u8>) -> HandlerFuture<'_> {
        Box::pin(async move {
            let offset = match header.offset.map(u64::try_from).transpose() {
                Ok(o) => o,
                Err(_) => {
                    let _ = sender.send_error_for(&header.id, WS_ERR_CODE_BAD_REQUEST, "offset must not be negative");
                    return;
                }
            };

            match self
                .service
                .write_chunk(&header.upload_id, offset, data, header.compute_hash)
                .await
            {
                Ok(receipt) => {
                    let resp = UploadChunkResponse {
                        upload_id: header.upload_id,
                        offset: receipt.offset,
                        bytes_written: receipt.bytes_written,
                        checksum: receipt.checksum,
                    };
                    match Message::new(&header.id, MessageType::UploadChunkResponse, Some(&resp)) {
                        Ok(reply) => {
                            let _ = sender.send_msg(reply);
                        }
                        Err(e) => tracing::error!("failed to build reply: {e}"),
                    }
                }
                Err(e) => {
                    tracing::debug!(upload_id = %header.upload_id, error = %e, "chunk rejected");
                    let _ = sender.send_error_for(&header.id, e.code(), &e.to_string());
                }
            }
        })
    }

    fn on_disconnected(&self, meta: ConnMeta) -> HandlerFuture<'_> {
        Box::pin(async move {
            // Sessions outlive connections; idle ones are left to the reaper.
            tracing::debug!(conn = meta.id, "connection closed, uploads kept");
        })
    }
}
