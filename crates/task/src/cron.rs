//! Lock-guarded periodic jobs. Only one instance of the service runs a given
//! job per tick; the others fail the lock acquire and skip.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use muster_core::{Application, Error, ExpiryRecord, Result, ScheduleStatus, StoreError};
use muster_index::IndexService;
use muster_node::NodeService;
use muster_store::{ExpiryStore, Locker, ResourceStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EXPIRY_LOCK: &str = "application-expiry";

/// Expires scheduled applications: flips each due application's schedule to
/// finished, persists it, and pushes the bumped version out to its nodes.
pub struct ExpiryJob {
    expiry: Arc<dyn ExpiryStore>,
    apps: Arc<dyn ResourceStore<Application>>,
    locker: Arc<dyn Locker>,
    nodes: NodeService,
    index: IndexService,
    lock_ttl_secs: u64,
}

impl ExpiryJob {
    pub fn new(
        expiry: Arc<dyn ExpiryStore>,
        apps: Arc<dyn ResourceStore<Application>>,
        locker: Arc<dyn Locker>,
        nodes: NodeService,
        index: IndexService,
        lock_ttl_secs: u64,
    ) -> Self {
        Self {
            expiry,
            apps,
            locker,
            nodes,
            index,
            lock_ttl_secs,
        }
    }

    pub fn spawn(self: Arc<Self>, every: Duration, mut close: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = close.changed() => break,
                }
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "expiry: run failed");
                }
            }
            debug!("expiry: job stopped");
        })
    }

    /// One guarded run. A held lock means another instance is on it, which
    /// is a skip, not an error. The lease is released on every return path.
    pub async fn run_once(&self) -> Result<()> {
        let lease = match self.locker.lock(EXPIRY_LOCK, self.lock_ttl_secs).await {
            Ok(l) => l,
            Err(StoreError::Conflict(_)) => {
                debug!("expiry: lock held elsewhere, skipping run");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let swept = self.sweep().await;
        if let Err(e) = self.locker.unlock(EXPIRY_LOCK, &lease).await {
            warn!(error = %e, "expiry: lease not released, waiting out the TTL");
        }
        swept
    }

    /// Per-record failures are logged and that record is kept for the next
    /// run; only records that succeeded end-to-end leave the expiry table.
    async fn sweep(&self) -> Result<()> {
        let due = self.expiry.list_expired(Utc::now()).await?;
        if due.is_empty() {
            return Ok(());
        }
        info!(records = due.len(), "expiry: sweeping");
        for record in due {
            match self.expire_one(&record).await {
                Ok(()) => {
                    counter!("expiry_applications_total", 1u64);
                    match self.expiry.delete_expiry(&record.namespace, &record.name).await {
                        Ok(()) | Err(StoreError::NotFound) => {}
                        Err(e) => {
                            warn!(ns = %record.namespace, app = %record.name, error = %e,
                                "expiry: record not deleted, will re-run");
                        }
                    }
                }
                Err(e) => {
                    warn!(ns = %record.namespace, app = %record.name, error = %e,
                        "expiry: record skipped");
                }
            }
        }
        Ok(())
    }

    async fn expire_one(&self, record: &ExpiryRecord) -> Result<()> {
        let mut app = self
            .apps
            .get(None, &record.namespace, &record.name)
            .await?
            .ok_or_else(|| Error::from_store(StoreError::NotFound, "application", &record.name))?;
        match &mut app.schedule {
            Some(s) if s.status != ScheduleStatus::Finished => s.status = ScheduleStatus::Finished,
            // Already finished or never scheduled: only the record remains.
            _ => return Ok(()),
        }
        let app = self.apps.update(None, app).await?;
        let matched = self.nodes.update_node_app_version(None, &app).await?;
        self.index
            .refresh_node_index_by_app(None, &record.namespace, &app.name, matched)
            .await?;
        debug!(ns = %record.namespace, app = %app.name, "expiry: schedule finished");
        Ok(())
    }
}
