//! Concurrent chunked upload pipeline.
//!
//! The source is read once, sequentially. Every range feeds the whole-file
//! hash in file order before it is handed to a worker, so the checksum sent
//! at finish never depends on the order in which chunks complete.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkup_protocol::binary::ChunkHeader;
use chunkup_protocol::constants::MessageType;
use chunkup_protocol::envelope::Message;
use chunkup_protocol::messages::{
    CreateUploadRequest, CreateUploadResponse, FinishUploadRequest, FinishUploadResponse,
    UploadChunkResponse,
};

use crate::connection::UploadConnection;
use crate::error::UploadError;
use crate::types::{ChunkRange, UploadEvent, UploadOptions, UploadOutcome};

/// Splits `[0, total)` into consecutive ranges of `chunk` bytes.
///
/// The last range carries the remainder. An empty source yields no ranges.
pub fn partition(total: u64, chunk: u64) -> Vec<ChunkRange> {
    if chunk == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::with_capacity(total.div_ceil(chunk) as usize);
    let mut offset = 0;
    while offset < total {
        let len = chunk.min(total - offset);
        ranges.push(ChunkRange { offset, len });
        offset += len;
    }
    ranges
}

/// Uploads a source to the server behind an [`UploadConnection`].
pub struct ChunkedUploader {
    conn: Arc<dyn UploadConnection>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl ChunkedUploader {
    /// Creates an uploader over the given connection.
    pub fn new(conn: Arc<dyn UploadConnection>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            conn,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Events are dropped rather than queued once the channel is full.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns a token that cancels the running upload.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads `total_size` bytes from `source` and returns where the server stored them.
    ///
    /// Any chunk failure stops the upload before finish is sent. The error
    /// names the failing range; the session stays open on the server, so that
    /// range can be re-sent with [`retry_range`](Self::retry_range).
    pub async fn upload<R>(
        &self,
        source: R,
        total_size: u64,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if options.chunk_size == 0 {
            return Err(UploadError::Validation("chunk size must be positive".into()));
        }
        if options.concurrency == 0 {
            return Err(UploadError::Validation("concurrency must be at least 1".into()));
        }

        let upload_id = match self.create(total_size, options.declare_size).await {
            Ok(id) => id,
            Err(e) => {
                self.emit(UploadEvent::Failed {
                    upload_id: None,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        info!(upload_id = %upload_id, total_size, "upload session created");
        self.emit(UploadEvent::Created {
            upload_id: upload_id.clone(),
            total_bytes: total_size,
        });

        match self.run(&upload_id, source, total_size, options).await {
            Ok(outcome) => {
                info!(upload_id = %upload_id, path = %outcome.path, "upload completed");
                self.emit(UploadEvent::Completed {
                    upload_id,
                    path: outcome.path.clone(),
                });
                Ok(outcome)
            }
            Err(e) => {
                warn!(upload_id = %upload_id, error = %e, "upload failed");
                self.emit(UploadEvent::Failed {
                    upload_id: Some(upload_id),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run<R>(
        &self,
        upload_id: &str,
        mut source: R,
        total_size: u64,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        // Append mode resolves offsets from EOF, so chunks must land in order.
        let concurrency = if options.declare_size {
            options.concurrency
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<Result<ChunkRange, UploadError>> = JoinSet::new();
        let mut hasher = Sha256::new();
        let mut sent = 0u64;

        for range in partition(total_size, options.chunk_size as u64) {
            let mut buf = vec![0u8; range.len as usize];
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                read = source.read_exact(&mut buf) => {
                    if let Err(e) = read {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            return Err(UploadError::Validation(format!(
                                "source ended before byte {} of {total_size}",
                                range.end()
                            )));
                        }
                        return Err(e.into());
                    }
                }
            }
            hasher.update(&buf);

            let permit = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                    Some(joined) = tasks.join_next() => {
                        self.acknowledge(upload_id, joined??, &mut sent, total_size);
                    }
                    permit = semaphore.clone().acquire_owned() => {
                        break permit.map_err(|_| UploadError::Cancelled)?;
                    }
                }
            };

            let conn = Arc::clone(&self.conn);
            let upload_id = upload_id.to_string();
            let append = !options.declare_size;
            let compute_hash = options.compute_chunk_hash;
            tasks.spawn(async move {
                let _permit = permit;
                send_range(conn.as_ref(), &upload_id, range, &buf, append, compute_hash)
                    .await
                    .map_err(|e| UploadError::ChunkFailed {
                        upload_id,
                        range,
                        source: Box::new(e),
                    })?;
                Ok(range)
            });
        }

        while let Some(joined) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            joined = tasks.join_next() => joined,
        } {
            self.acknowledge(upload_id, joined??, &mut sent, total_size);
        }

        // A longer source than declared is truncated to the declared size.
        let checksum = hex::encode(hasher.finalize());
        self.emit(UploadEvent::Finishing {
            upload_id: upload_id.to_string(),
        });
        let path = self
            .finish(upload_id, &checksum, options.target_path.clone())
            .await?;

        Ok(UploadOutcome {
            upload_id: upload_id.to_string(),
            path,
            checksum,
            bytes: sent,
        })
    }

    fn acknowledge(&self, upload_id: &str, range: ChunkRange, sent: &mut u64, total: u64) {
        *sent += range.len;
        debug!(upload_id, offset = range.offset, bytes = range.len, "chunk acknowledged");
        self.emit(UploadEvent::ChunkSent {
            upload_id: upload_id.to_string(),
            range,
            sent_bytes: *sent,
            total_bytes: total,
        });
    }

    /// Re-sends one exact range of an open session.
    ///
    /// Writes are idempotent per range, so this is safe after a
    /// [`UploadError::ChunkFailed`] regardless of what reached the server.
    pub async fn retry_range(
        &self,
        upload_id: &str,
        range: ChunkRange,
        bytes: &[u8],
    ) -> Result<(), UploadError> {
        if bytes.len() as u64 != range.len {
            return Err(UploadError::Validation(format!(
                "range {range} needs {} bytes, got {}",
                range.len,
                bytes.len()
            )));
        }
        send_range(self.conn.as_ref(), upload_id, range, bytes, false, false).await
    }

    /// Opens a session on the server and returns its id.
    pub async fn create(&self, total_size: u64, declare_size: bool) -> Result<String, UploadError> {
        let declared_size = if declare_size {
            let size = i64::try_from(total_size)
                .map_err(|_| UploadError::Validation(format!("size {total_size} too large")))?;
            Some(size)
        } else {
            None
        };
        let req = CreateUploadRequest {
            declared_size,
            target_path: None,
        };
        let resp = self
            .conn
            .send_request(MessageType::CreateUpload, serde_json::to_value(&req)?)
            .await?;
        let created: CreateUploadResponse = expect_payload(&resp, MessageType::UploadCreated)?;
        Ok(created.upload_id)
    }

    /// Asks the server to verify `checksum` and store the file.
    pub async fn finish(
        &self,
        upload_id: &str,
        checksum: &str,
        target_path: Option<String>,
    ) -> Result<String, UploadError> {
        let req = FinishUploadRequest {
            upload_id: upload_id.to_string(),
            checksum: checksum.to_string(),
            target_path,
        };
        let resp = self
            .conn
            .send_request(MessageType::FinishUpload, serde_json::to_value(&req)?)
            .await?;
        let finished: FinishUploadResponse = expect_payload(&resp, MessageType::UploadFinished)?;
        Ok(finished.path)
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }
}

/// Sends one range and checks the acknowledgement against it.
async fn send_range(
    conn: &dyn UploadConnection,
    upload_id: &str,
    range: ChunkRange,
    data: &[u8],
    append: bool,
    compute_hash: bool,
) -> Result<(), UploadError> {
    let header = ChunkHeader {
        id: String::new(),
        upload_id: upload_id.to_string(),
        offset: if append {
            None
        } else {
            Some(i64::try_from(range.offset).map_err(|_| {
                UploadError::Validation(format!("offset {} too large", range.offset))
            })?)
        },
        compute_hash,
    };
    let resp = conn.send_chunk(header, data).await?;
    let ack: UploadChunkResponse = expect_payload(&resp, MessageType::UploadChunkResponse)?;

    if ack.offset != range.offset || ack.bytes_written != range.len {
        return Err(UploadError::Protocol(format!(
            "chunk {range} acknowledged as {} bytes at {}",
            ack.bytes_written, ack.offset
        )));
    }
    if compute_hash {
        let local = hex::encode(Sha256::digest(data));
        if ack.checksum.as_deref() != Some(local.as_str()) {
            return Err(UploadError::Protocol(format!("chunk {range} hash differs on server")));
        }
    }
    Ok(())
}

fn expect_payload<T: serde::de::DeserializeOwned>(
    resp: &Message,
    expected: MessageType,
) -> Result<T, UploadError> {
    if resp.msg_type != expected {
        return Err(UploadError::Protocol(format!(
            "expected {expected:?}, got {:?}",
            resp.msg_type
        )));
    }
    resp.parse_payload::<T>()?
        .ok_or_else(|| UploadError::Protocol(format!("empty {expected:?} payload")))
}
