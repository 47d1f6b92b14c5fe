use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::chunked::{ChunkReceipt, ChunkWriter};
use crate::finish::Finisher;
use crate::reaper::Reaper;
use crate::store::SessionStore;
use crate::types::{SessionSnapshot, SessionState, artifact_path};
use crate::TransferError;

/// Deployment-wide behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Reject sessions created without a declared size.
    pub require_declared_size: bool,
    /// Largest accepted chunk payload.
    pub max_chunk_size: Option<usize>,
}

/// Single entry point wiring the store, writer and finisher together.
pub struct UploadService {
    store: Arc<SessionStore>,
    writer: ChunkWriter,
    finisher: Finisher,
    options: ServiceOptions,
}

impl UploadService {
    pub fn new(store: Arc<SessionStore>, options: ServiceOptions) -> Self {
        let mut writer = ChunkWriter::new(Arc::clone(&store));
        if let Some(limit) = options.max_chunk_size {
            writer = writer.with_max_chunk_size(limit);
        }
        Self {
            finisher: Finisher::new(Arc::clone(&store)),
            writer,
            store,
            options,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Builds a reaper sharing this service's store.
    pub fn reaper(&self, ttl: Duration, interval: Duration) -> Reaper {
        Reaper::new(Arc::clone(&self.store), ttl, interval)
    }

    pub async fn create(
        &self,
        declared_size: Option<i64>,
        target_path: Option<String>,
    ) -> Result<String, TransferError> {
        if self.options.require_declared_size && declared_size.is_none() {
            return Err(TransferError::Validation(
                "this server requires a declared size".into(),
            ));
        }
        self.store.create(declared_size, target_path).await
    }

    pub async fn write_chunk(
        &self,
        id: &str,
        offset: Option<u64>,
        data: Vec<u8>,
        compute_hash: bool,
    ) -> Result<ChunkReceipt, TransferError> {
        self.writer.write_chunk(id, offset, data, compute_hash).await
    }

    pub async fn finish(
        &self,
        id: &str,
        expected_checksum: &str,
        target_path: Option<String>,
    ) -> Result<String, TransferError> {
        self.finisher.finish(id, expected_checksum, target_path).await
    }

    pub async fn rename(&self, id: &str, dest: &str) -> Result<(), TransferError> {
        self.finisher.rename(id, dest).await
    }

    pub async fn get(&self, id: &str) -> Result<SessionSnapshot, TransferError> {
        self.store.get(id).await
    }

    /// Opens the verified artifact of a completed session that has not been
    /// moved yet.
    pub async fn open_completed(&self, id: &str) -> Result<Box<dyn Read + Send>, TransferError> {
        let handle = self.store.handle(id)?;
        let _lifecycle = handle.lifecycle.read().await;
        let state = handle.record().await.state;
        if state != SessionState::Completed {
            return Err(TransferError::Conflict(format!(
                "upload {id} is {state}, not completed"
            )));
        }
        let artifact = artifact_path(id);
        self.store.blocking(move |s| s.open_read(&artifact)).await
    }
}
