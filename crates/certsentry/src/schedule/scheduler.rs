//! Single-flight job scheduler.
//!
//! At most one job is pending or running at a time: scheduling a new job
//! cancels the previous one. Cancellation is cooperative and observed only
//! while a job is sleeping; a job that has begun fetching or reconciling
//! runs to completion so partial on-disk state is never abandoned mid-write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetch::RemoteFetcher;
use crate::reconcile::ReconciliationEngine;
use crate::schedule::MaintenanceWindow;
use crate::store::CertificateStore;

/// Delay between fetch attempts while the remote service is unreachable
const FETCH_RETRY_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Delay before re-attempting a failed write while still inside the window
const WRITE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound of the random jitter added to every scheduled instant
const JITTER_MAX_SECS: u64 = 60;

/// The kind of work a scheduled job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Retry fetching key/cert PEM from the remote service
    FetchRetry,
    /// Write in-memory material to disk inside the maintenance window
    WriteToDisk,
}

struct PendingJob {
    cancel: CancellationToken,
    kind: JobKind,
}

/// Owner of the single pending-job slot.
///
/// `schedule` and `cancel_pending` are the only mutation points for the
/// pending job, serialized by an internal lock; no cancel handle is ever
/// shared outside this type.
pub struct Scheduler {
    window: MaintenanceWindow,
    store: Arc<CertificateStore>,
    engine: Arc<ReconciliationEngine>,
    fetcher: Arc<RemoteFetcher>,
    shutdown: CancellationToken,
    pending: Mutex<Option<PendingJob>>,
}

impl Scheduler {
    /// Create a scheduler; job cancel tokens are children of `shutdown`,
    /// so process shutdown cancels whatever is pending.
    pub fn new(
        window: MaintenanceWindow,
        store: Arc<CertificateStore>,
        engine: Arc<ReconciliationEngine>,
        fetcher: Arc<RemoteFetcher>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            window,
            store,
            engine,
            fetcher,
            shutdown,
            pending: Mutex::new(None),
        })
    }

    /// Schedule a job, superseding any pending one.
    pub fn schedule(self: &Arc<Self>, kind: JobKind) {
        let cancel = {
            let mut pending = self.pending.lock();
            if let Some(old) = pending.take() {
                debug!(kind = ?old.kind, "superseding pending job");
                old.cancel.cancel();
            }
            let cancel = self.shutdown.child_token();
            *pending = Some(PendingJob {
                cancel: cancel.clone(),
                kind,
            });
            cancel
        };

        let scheduler = Arc::clone(self);
        match kind {
            JobKind::WriteToDisk => {
                tokio::spawn(async move { scheduler.run_write_job(cancel).await });
            }
            JobKind::FetchRetry => {
                tokio::spawn(async move { scheduler.run_fetch_job(cancel).await });
            }
        }
    }

    /// Cancel the pending job, if any.
    pub fn cancel_pending(&self) {
        let mut pending = self.pending.lock();
        if let Some(old) = pending.take() {
            debug!(kind = ?old.kind, "canceling pending job");
            old.cancel.cancel();
        }
    }

    /// Write job: reconcile inside the maintenance window, re-arming while
    /// the disk stays stale.
    async fn run_write_job(&self, cancel: CancellationToken) {
        let mut first_attempt = true;

        loop {
            let now = Local::now().naive_local();

            let delay = if self.window.contains(now) {
                if first_attempt {
                    info!("write certs job executing immediately (inside maintenance window)");
                    None
                } else {
                    // retry pacing while the window is open
                    Some(WRITE_RETRY_INTERVAL + jitter())
                }
            } else {
                let run_at = self.window.next_start_after(now);
                let until = (run_at - now).to_std().unwrap_or(Duration::ZERO) + jitter();
                info!(run_at = %run_at, "scheduling write certs job for next maintenance window");
                Some(until)
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("write certs job canceled while waiting (superseded or shutting down)");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("write certs job executing");
            }
            first_attempt = false;

            let disk_still_stale = self.engine.reconcile(false).await;
            if !disk_still_stale {
                info!("write certs job complete");
                return;
            }

            if cancel.is_cancelled() {
                debug!("write certs job superseded, leaving retry to its successor");
                return;
            }
            warn!("disk still needs an update, re-arming write certs job");
        }
    }

    /// Fetch job: retry pulling material from the remote service, then hand
    /// off to a write job once a pair is installed.
    async fn run_fetch_job(self: &Arc<Self>, cancel: CancellationToken) {
        loop {
            let delay = FETCH_RETRY_INTERVAL + jitter();
            info!(delay_secs = delay.as_secs(), "scheduling fetch certs job");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("fetch certs job canceled while waiting (superseded or shutting down)");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            info!("fetch certs job executing");
            match self.fetcher.fetch_pair().await {
                Ok((key_pem, cert_pem)) => match self.store.update(&key_pem, &cert_pem) {
                    Ok(true) => {
                        info!("new key/cert pair installed from remote");
                        self.schedule(JobKind::WriteToDisk);
                        return;
                    }
                    Ok(false) => {
                        info!("fetched key/cert pair identical to current");
                        self.schedule(JobKind::WriteToDisk);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "fetched key/cert pair rejected");
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to fetch key/cert from remote");
                }
            }

            if cancel.is_cancelled() {
                debug!("fetch certs job superseded, leaving retry to its successor");
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_token(&self) -> Option<CancellationToken> {
        self.pending.lock().as_ref().map(|p| p.cancel.clone())
    }

    #[cfg(test)]
    pub(crate) fn pending_kind(&self) -> Option<JobKind> {
        self.pending.lock().as_ref().map(|p| p.kind)
    }
}

/// Random 0-59s offset so many agents do not write in the same instant
fn jitter() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(0..JITTER_MAX_SECS))
}
