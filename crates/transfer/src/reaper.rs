use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::SessionStore;
use crate::types::SessionState;
use crate::{PENDING_DIR, TransferError};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions expired and removed.
    pub expired: usize,
    /// Unindexed pending entries removed.
    pub orphans: usize,
    /// Items whose removal failed; retried on a later sweep.
    pub failed: usize,
}

/// Periodic garbage collector for abandoned sessions.
pub struct Reaper {
    store: Arc<SessionStore>,
    ttl: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<SessionStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            ttl,
            interval,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sweeps every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(ttl_secs = self.ttl.as_secs(), interval_secs = self.interval.as_secs(), "reaper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(self.ttl).await;
                }
            }
        }
        info!("reaper stopped");
    }

    /// Removes every session idle for longer than `ttl`, then every pending
    /// entry that is not indexed and older than `ttl`.
    ///
    /// Completed sessions are never touched. A failure on one item does not
    /// stop the sweep.
    pub async fn sweep(&self, ttl: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.store.handles() {
            if handle.idle() < ttl {
                continue;
            }
            let _lifecycle = handle.lifecycle.write().await;
            // Re-check: a finish or a write may have run while we waited.
            if !self.store.is_live(&handle) || handle.idle() < ttl {
                continue;
            }
            let state = handle.record().await.state;
            if state == SessionState::Completed {
                continue;
            }

            self.store.seal(&handle, SessionState::Expired).await;
            self.store.retire(&handle.id);
            match self.store.discard(&handle.id).await {
                Ok(()) => {
                    info!(upload_id = %handle.id, previous = %state, "upload session expired");
                    report.expired += 1;
                }
                Err(e) => {
                    warn!(upload_id = %handle.id, error = %e, "failed to remove expired session");
                    report.failed += 1;
                }
            }
        }

        match self.sweep_orphans(ttl).await {
            Ok((orphans, failed)) => {
                report.orphans += orphans;
                report.failed += failed;
            }
            Err(e) => {
                warn!(error = %e, "failed to scan pending uploads");
                report.failed += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                orphans = report.orphans,
                failed = report.failed,
                "sweep finished"
            );
        } else {
            debug!("sweep found nothing to remove");
        }
        report
    }

    async fn sweep_orphans(&self, ttl: Duration) -> Result<(usize, usize), TransferError> {
        let entries = self
            .store
            .blocking(|s| match s.walk(Path::new(PENDING_DIR)) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
                other => other,
            })
            .await?;

        let now = SystemTime::now();
        let stale: Vec<_> = entries
            .into_iter()
            .filter(|e| {
                let age = now.duration_since(e.modified).unwrap_or_default();
                let indexed = e
                    .path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|id| self.store.contains(id));
                age >= ttl && !indexed
            })
            .collect();
        if stale.is_empty() {
            return Ok((0, 0));
        }

        let results = self
            .store
            .blocking(move |s| {
                Ok(stale
                    .into_iter()
                    .map(|entry| {
                        let result = if entry.is_dir {
                            s.remove_dir_all(&entry.path)
                        } else {
                            s.remove_file(&entry.path)
                        };
                        (entry.path, result)
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let (mut removed, mut failed) = (0, 0);
        for (path, result) in results {
            match result {
                Ok(()) => {
                    warn!(path = %path.display(), "removed orphaned pending entry");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove orphaned entry");
                    failed += 1;
                }
            }
        }
        Ok((removed, failed))
    }
}
