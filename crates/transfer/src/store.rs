use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::storage::Storage;
use crate::types::{SessionRecord, SessionSnapshot, SessionState, artifact_path, record_path, session_dir};
use crate::{PENDING_DIR, TransferError, validate_destination};

/// In-memory state for one session.
///
/// `lifecycle` is the per-session exclusive section: chunk writers hold it
/// shared, the finisher and reaper hold it exclusively. `append_lock`
/// serializes append-mode writes only.
pub(crate) struct SessionHandle {
    pub(crate) id: String,
    record: tokio::sync::Mutex<SessionRecord>,
    last_activity: Mutex<Instant>,
    pub(crate) append_lock: tokio::sync::Mutex<()>,
    pub(crate) lifecycle: RwLock<()>,
}

impl SessionHandle {
    fn new(record: SessionRecord, last_activity: Instant) -> Self {
        Self {
            id: record.id.clone(),
            record: tokio::sync::Mutex::new(record),
            last_activity: Mutex::new(last_activity),
            append_lock: tokio::sync::Mutex::new(()),
            lifecycle: RwLock::new(()),
        }
    }

    pub(crate) async fn record(&self) -> SessionRecord {
        self.record.lock().await.clone()
    }

    pub(crate) fn idle(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Outcome of [`SessionStore::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub removed: usize,
}

/// Index of live sessions plus their durable records.
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Runs a storage operation on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Storage) -> io::Result<T> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        let result = tokio::task::spawn_blocking(move || f(storage.as_ref())).await?;
        Ok(result?)
    }

    /// Creates a session: allocates the artifact and writes its record.
    ///
    /// The session becomes visible only once both exist on storage.
    pub async fn create(
        &self,
        declared_size: Option<i64>,
        target_path: Option<String>,
    ) -> Result<String, TransferError> {
        let declared_size = match declared_size {
            Some(size) if size < 0 => {
                return Err(TransferError::Validation(format!(
                    "declared size must not be negative: {size}"
                )));
            }
            Some(size) => Some(size as u64),
            None => None,
        };
        if let Some(path) = &target_path {
            validate_destination(path)?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let record = SessionRecord::new(id.clone(), declared_size, target_path);
        let bytes = serde_json::to_vec_pretty(&record)?;

        let dir = session_dir(&id);
        let artifact = artifact_path(&id);
        let meta = record_path(&id);
        self.blocking(move |s| {
            s.create(&artifact, declared_size.unwrap_or(0))?;
            if let Err(e) = s.write_file_atomic(&meta, &bytes) {
                let _ = s.remove_dir_all(&dir);
                return Err(e);
            }
            Ok(())
        })
        .await?;

        let handle = Arc::new(SessionHandle::new(record, Instant::now()));
        self.sessions().insert(id.clone(), handle);
        info!(upload_id = %id, declared_size = ?declared_size, "upload session created");
        Ok(id)
    }

    /// Returns a snapshot of the session.
    pub async fn get(&self, id: &str) -> Result<SessionSnapshot, TransferError> {
        let handle = self.handle(id)?;
        let record = handle.record().await;
        let artifact = artifact_path(id);
        let current_size = self.blocking(move |s| s.len(&artifact)).await?;
        Ok(SessionSnapshot {
            record,
            current_size,
            idle: handle.idle(),
        })
    }

    /// Marks the session as active now and persists `updated_at`.
    pub async fn touch(&self, id: &str) -> Result<(), TransferError> {
        let handle = self.handle(id)?;
        self.touch_handle(&handle).await
    }

    pub(crate) async fn touch_handle(&self, handle: &SessionHandle) -> Result<(), TransferError> {
        *handle
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        let mut record = handle.record.lock().await;
        let mut next = record.clone();
        next.updated_at = chrono::Utc::now();
        self.persist(&next).await?;
        *record = next;
        Ok(())
    }

    /// Applies `f` to the record, persists it, and keeps the change only if
    /// the write succeeded.
    pub(crate) async fn update<F>(&self, handle: &SessionHandle, f: F) -> Result<SessionRecord, TransferError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let mut record = handle.record.lock().await;
        let mut next = record.clone();
        f(&mut next);
        self.persist(&next).await?;
        *record = next.clone();
        Ok(next)
    }

    /// Changes the in-memory state without persisting it.
    async fn set_state(&self, handle: &SessionHandle, state: SessionState) {
        handle.record.lock().await.transition(state);
    }

    /// Returns a session to `Open` after an interrupted verification.
    ///
    /// The in-memory state changes even when the record cannot be written;
    /// recovery restores a `verifying` record as `Open` as well.
    pub(crate) async fn reopen(&self, handle: &SessionHandle) {
        self.set_state(handle, SessionState::Open).await;
        if let Err(e) = self.update(handle, |_| {}).await {
            warn!(upload_id = %handle.id, error = %e, "failed to persist reopened session");
        }
    }

    /// Persists a terminal state ahead of removal so that a leftover
    /// directory is never recovered as a live session.
    pub(crate) async fn seal(&self, handle: &SessionHandle, state: SessionState) {
        if let Err(e) = self.update(handle, |r| r.transition(state)).await {
            warn!(upload_id = %handle.id, %state, error = %e, "failed to persist terminal state");
            self.set_state(handle, state).await;
        }
    }

    async fn persist(&self, record: &SessionRecord) -> Result<(), TransferError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let meta = record_path(&record.id);
        self.blocking(move |s| s.write_file_atomic(&meta, &bytes)).await
    }

    pub(crate) fn handle(&self, id: &str) -> Result<Arc<SessionHandle>, TransferError> {
        if id.is_empty() {
            return Err(TransferError::Validation("missing upload id".into()));
        }
        self.sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    /// True while `handle` is still the indexed session for its id.
    pub(crate) fn is_live(&self, handle: &Arc<SessionHandle>) -> bool {
        self.sessions()
            .get(&handle.id)
            .is_some_and(|h| Arc::ptr_eq(h, handle))
    }

    pub(crate) fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions().values().cloned().collect()
    }

    /// Removes the session from the index.
    pub(crate) fn retire(&self, id: &str) {
        self.sessions().remove(id);
    }

    /// Removes the session's directory, treating an already missing one as
    /// success.
    pub(crate) async fn discard(&self, id: &str) -> Result<(), TransferError> {
        let dir = session_dir(id);
        self.blocking(move |s| match s.remove_dir_all(&dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    /// Ids of every indexed session.
    pub fn list(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Reloads sessions persisted by a previous process.
    ///
    /// Open and verifying records come back as `Open`, completed ones as
    /// `Completed`. A directory missing either its record or its artifact
    /// is removed.
    pub async fn recover(&self) -> Result<RecoveryReport, TransferError> {
        let (records, removed) = self
            .blocking(|s| {
                let entries = match s.walk(Path::new(PENDING_DIR)) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e),
                };
                let mut records = Vec::new();
                let mut removed = 0;
                for entry in entries {
                    match load_entry(s, &entry.path, entry.is_dir) {
                        Some(record) => records.push(record),
                        None => {
                            warn!(path = %entry.path.display(), "removing orphaned pending entry");
                            let result = if entry.is_dir {
                                s.remove_dir_all(&entry.path)
                            } else {
                                s.remove_file(&entry.path)
                            };
                            if let Err(e) = result {
                                warn!(path = %entry.path.display(), error = %e, "failed to remove orphan");
                            }
                            removed += 1;
                        }
                    }
                }
                Ok((records, removed))
            })
            .await?;

        let mut report = RecoveryReport {
            removed,
            ..Default::default()
        };
        for mut record in records {
            if self.contains(&record.id) {
                continue;
            }
            let age = record.age();
            if record.state == SessionState::Verifying {
                record.state = SessionState::Open;
                self.persist(&record).await?;
            }
            let now = Instant::now();
            let last_activity = now.checked_sub(age).unwrap_or(now);
            info!(upload_id = %record.id, state = %record.state, "upload session recovered");
            let id = record.id.clone();
            self.sessions()
                .insert(id, Arc::new(SessionHandle::new(record, last_activity)));
            report.restored += 1;
        }
        Ok(report)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loads the record for a pending directory, or `None` if the entry is an
/// orphan that should be removed.
fn load_entry(s: &dyn Storage, dir: &Path, is_dir: bool) -> Option<SessionRecord> {
    if !is_dir {
        return None;
    }
    let id = dir.file_name()?.to_str()?;
    let bytes = s.read_file(&record_path(id)).ok()?;
    let record: SessionRecord = serde_json::from_slice(&bytes).ok()?;
    if record.id != id {
        return None;
    }
    match record.state {
        SessionState::Open | SessionState::Verifying | SessionState::Completed => {}
        SessionState::Failed | SessionState::Expired => return None,
    }
    s.len(&artifact_path(id)).ok()?;
    Some(record)
}
