use std::io::Read;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::SessionStore;
use crate::types::{SessionState, artifact_path};
use crate::TransferError;

/// Read buffer used when hashing an artifact.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streams `reader` through SHA-256 and returns the hex-encoded digest.
pub fn checksum_reader(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Result of a successful chunk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// Offset the bytes landed at (resolved end of file in append mode).
    pub offset: u64,
    pub bytes_written: u64,
    /// SHA-256 of the chunk, when requested. A progress hint only.
    pub checksum: Option<String>,
}

/// Applies offset-scoped byte ranges to session artifacts.
pub struct ChunkWriter {
    store: Arc<SessionStore>,
    max_chunk_size: Option<usize>,
}

impl ChunkWriter {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            max_chunk_size: None,
        }
    }

    /// Rejects chunks larger than `limit` bytes.
    pub fn with_max_chunk_size(mut self, limit: usize) -> Self {
        self.max_chunk_size = Some(limit);
        self
    }

    /// Writes `data` into the session's artifact.
    ///
    /// With an explicit `offset` the write is positioned and runs alongside
    /// other writers to the same session. Without one, the bytes go to the
    /// current end of file and appends to the session are serialized.
    pub async fn write_chunk(
        &self,
        id: &str,
        offset: Option<u64>,
        data: Vec<u8>,
        compute_hash: bool,
    ) -> Result<ChunkReceipt, TransferError> {
        let handle = self.store.handle(id)?;
        if let Some(limit) = self.max_chunk_size {
            if data.len() > limit {
                return Err(TransferError::Validation(format!(
                    "chunk of {} bytes exceeds limit of {limit}",
                    data.len()
                )));
            }
        }

        let _lifecycle = handle.lifecycle.read().await;
        if !self.store.is_live(&handle) {
            return Err(TransferError::NotFound(id.to_string()));
        }
        let record = handle.record().await;
        if record.state != SessionState::Open {
            return Err(TransferError::Conflict(format!(
                "upload {id} is {}, not open",
                record.state
            )));
        }

        let len = data.len() as u64;
        let artifact = artifact_path(id);
        let (offset, checksum) = match offset {
            Some(offset) => {
                if let Some(size) = record.declared_size {
                    check_bounds(offset, len, size)?;
                }
                self.store
                    .blocking(move |s| {
                        s.write_at(&artifact, offset, &data)?;
                        Ok((offset, compute_hash.then(|| checksum_bytes(&data))))
                    })
                    .await?
            }
            None => {
                let _append = handle.append_lock.lock().await;
                let declared = record.declared_size;
                self.store
                    .blocking(move |s| {
                        if let Some(size) = declared {
                            let eof = s.len(&artifact)?;
                            if eof.checked_add(len).is_none_or(|end| end > size) {
                                return Ok(Err(TransferError::Range(format!(
                                    "append of {len} bytes at {eof} exceeds declared size {size}"
                                ))));
                            }
                        }
                        let offset = s.append(&artifact, &data)?;
                        Ok(Ok((offset, compute_hash.then(|| checksum_bytes(&data)))))
                    })
                    .await??
            }
        };

        self.store.touch_handle(&handle).await?;
        debug!(upload_id = %id, offset, bytes = len, "chunk written");
        Ok(ChunkReceipt {
            offset,
            bytes_written: len,
            checksum,
        })
    }
}

fn check_bounds(offset: u64, len: u64, size: u64) -> Result<(), TransferError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TransferError::Range(format!(
            "chunk [{offset}, +{len}) exceeds declared size {size}"
        ))),
    }
}
