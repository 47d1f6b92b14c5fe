use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::chunked::checksum_reader;
use crate::store::{SessionHandle, SessionStore};
use crate::types::{SessionState, artifact_path};
use crate::{TransferError, validate_destination};

type FinishOutcome = Result<String, TransferError>;

/// Verifies completed artifacts and promotes them to their destination.
///
/// Concurrent `finish` calls for the same id share one execution: the first
/// caller runs it, later callers wait for and return the same outcome.
pub struct Finisher {
    store: Arc<SessionStore>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<FinishOutcome>>>>,
}

impl Finisher {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Hashes the artifact, compares it with `expected_checksum` and, on a
    /// match, moves it to `target_path` (or the path recorded at creation).
    ///
    /// Returns the destination path, or the pending artifact path when no
    /// destination is known yet.
    pub async fn finish(
        &self,
        id: &str,
        expected_checksum: &str,
        target_path: Option<String>,
    ) -> FinishOutcome {
        if id.is_empty() {
            return Err(TransferError::Validation("missing upload id".into()));
        }
        if expected_checksum.is_empty() {
            return Err(TransferError::Validation("missing checksum".into()));
        }
        if let Some(path) = &target_path {
            validate_destination(path)?;
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(in_flight.entry(id.to_string()).or_default())
        };

        let store = Arc::clone(&self.store);
        let owned_id = id.to_string();
        let expected = expected_checksum.to_string();
        let outcome = cell
            .get_or_init(|| async move {
                // Detached so a dropped caller cannot abandon the critical section.
                tokio::spawn(run_finish(store, owned_id, expected, target_path))
                    .await
                    .unwrap_or_else(|e| Err(e.into()))
            })
            .await
            .clone();

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(id).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            in_flight.remove(id);
        }
        outcome
    }

    /// Assigns or applies a destination path.
    ///
    /// An open session records `dest` as its target. A completed session has
    /// its artifact moved to `dest` and is retired.
    pub async fn rename(&self, id: &str, dest: &str) -> Result<(), TransferError> {
        validate_destination(dest)?;
        let handle = self.store.handle(id)?;

        let record = handle.record().await;
        match record.state {
            SessionState::Open => {
                let _lifecycle = handle.lifecycle.read().await;
                ensure_live(&self.store, &handle)?;
                let dest = dest.to_string();
                self.store
                    .update(&handle, |r| {
                        if r.state == SessionState::Open {
                            r.target_path = Some(dest);
                            r.updated_at = chrono::Utc::now();
                        }
                    })
                    .await
                    .and_then(|r| match r.state {
                        SessionState::Open => Ok(()),
                        other => Err(not_open(id, other)),
                    })
            }
            SessionState::Completed => {
                let _lifecycle = handle.lifecycle.write().await;
                ensure_live(&self.store, &handle)?;
                promote(&self.store, &handle, dest).await.map(|_| ())
            }
            other => Err(not_open(id, other)),
        }
    }
}

fn not_open(id: &str, state: SessionState) -> TransferError {
    TransferError::Conflict(format!("upload {id} is {state}"))
}

fn ensure_live(store: &SessionStore, handle: &Arc<SessionHandle>) -> Result<(), TransferError> {
    if store.is_live(handle) {
        Ok(())
    } else {
        Err(TransferError::NotFound(handle.id.clone()))
    }
}

/// The exclusive "hash, rename, retire" section for one session.
async fn run_finish(
    store: Arc<SessionStore>,
    id: String,
    expected: String,
    target_path: Option<String>,
) -> FinishOutcome {
    let handle = store.handle(&id)?;
    let _lifecycle = handle.lifecycle.write().await;
    ensure_live(&store, &handle)?;

    let record = handle.record().await;
    let destination = target_path.or(record.target_path.clone());
    match record.state {
        SessionState::Open => {}
        SessionState::Completed => {
            // Verified earlier without a destination.
            return match destination {
                Some(dest) => promote(&store, &handle, &dest).await,
                None => Ok(pending_path(&id)),
            };
        }
        other => return Err(not_open(&id, other)),
    }

    let expected_lower = expected.to_ascii_lowercase();
    store
        .update(&handle, |r| {
            r.transition(SessionState::Verifying);
            r.expected_checksum = Some(expected_lower);
        })
        .await?;
    info!(upload_id = %id, "verifying upload");

    let artifact = artifact_path(&id);
    let actual = match store
        .blocking(move |s| checksum_reader(s.open_read(&artifact)?))
        .await
    {
        Ok(actual) => actual,
        Err(e) => {
            warn!(upload_id = %id, error = %e, "failed to hash artifact");
            store.reopen(&handle).await;
            return Err(e);
        }
    };

    if !actual.eq_ignore_ascii_case(&expected) {
        store.seal(&handle, SessionState::Failed).await;
        store.retire(&id);
        if let Err(e) = store.discard(&id).await {
            warn!(upload_id = %id, error = %e, "failed to discard rejected artifact");
        }
        info!(upload_id = %id, %expected, %actual, "upload failed checksum verification");
        return Err(TransferError::ChecksumMismatch { expected, actual });
    }

    let completed = store
        .update(&handle, |r| {
            r.transition(SessionState::Completed);
            if destination.is_some() {
                r.target_path = destination.clone();
            }
        })
        .await;
    if let Err(e) = completed {
        warn!(upload_id = %id, error = %e, "failed to record verified upload");
        store.reopen(&handle).await;
        return Err(e);
    }

    match destination {
        Some(dest) => promote(&store, &handle, &dest).await,
        None => {
            info!(upload_id = %id, "upload verified, awaiting destination");
            Ok(pending_path(&id))
        }
    }
}

/// Moves a verified artifact to `dest` and retires the session.
///
/// Callers hold the session's lifecycle lock exclusively.
async fn promote(store: &SessionStore, handle: &SessionHandle, dest: &str) -> FinishOutcome {
    let id = handle.id.clone();
    let artifact = artifact_path(&id);
    let to = Path::new(dest).to_path_buf();
    store.blocking(move |s| s.rename(&artifact, &to)).await?;

    store.retire(&id);
    if let Err(e) = store.discard(&id).await {
        warn!(upload_id = %id, error = %e, "failed to remove session directory");
    }
    info!(upload_id = %id, path = %dest, "upload completed");
    Ok(dest.to_string())
}

fn pending_path(id: &str) -> String {
    artifact_path(id).to_string_lossy().into_owned()
}
