//! Sync Scheduler - write-behind persistence
//!
//! Decouples cache writes from disk I/O. `put` only records the entry in the
//! dirty set; a background worker drains it into the disk tier.
//!
//! # Design
//!
//! - Dirty set is primary key -> latest entry (DashMap); repeated puts collapse
//! - The worker flushes when woken by a put and on every interval tick, and
//!   runs disk cleanup on ticks
//! - Flushes, cleanup and removals go through an async gate, so they never
//!   interleave and `flush().await` observes all prior work. The coordinator's
//!   index repairs touch only the working set and ride along with the next save
//! - Document saves run on the blocking pool
//! - Shutdown cancels the worker and runs a final flush within a time budget

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::disk::DiskTier;
use super::entry::CacheEntry;
use super::key::is_project_key;
use super::metrics::CacheMetrics;
use crate::error::{Error, Result};

/// Outcome of a shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Entries written by the final flush
    pub flushed: usize,
    /// Whether the time budget ran out
    pub timed_out: bool,
    /// Dirty entries left behind
    pub pending: usize,
}

/// Write-behind scheduler owning entry writes to the disk tier
pub struct SyncScheduler {
    disk: Arc<DiskTier>,
    metrics: Arc<CacheMetrics>,
    pending: DashMap<String, CacheEntry>,
    /// Serializes flushes and disk mutations
    gate: tokio::sync::Mutex<()>,
    wake: Notify,
    interval: Duration,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        disk: Arc<DiskTier>,
        metrics: Arc<CacheMetrics>,
        interval: Duration,
        shutdown_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            disk,
            metrics,
            pending: DashMap::new(),
            gate: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            interval,
            shutdown_timeout,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the background worker on the current Tokio runtime
    ///
    /// Without a runtime nothing is spawned and entries are only written by
    /// explicit [`flush`](Self::flush) calls.
    pub fn start(self: &Arc<Self>) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No Tokio runtime, background sync disabled");
                return false;
            }
        };

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return true;
        }
        let scheduler = Arc::clone(self);
        *worker = Some(handle.spawn(scheduler.run()));
        true
    }

    /// Record an entry for the next flush and wake the worker
    pub fn mark_dirty(&self, entry: CacheEntry) {
        self.pending.insert(entry.primary_key(), entry);
        self.wake.notify_one();
    }

    /// Entry waiting to be flushed, if any
    pub fn pending_entry(&self, primary_key: &str) -> Option<CacheEntry> {
        self.pending.get(primary_key).map(|entry| entry.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Background loop
    #[instrument(skip(self))]
    async fn run(self: Arc<Self>) {
        info!("Starting sync worker (interval {:?})", self.interval);

        let mut tick = interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Sync worker shutting down");
                    break;
                }

                _ = tick.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("Periodic flush failed: {}", e);
                    }
                    self.cleanup().await;
                }

                _ = self.wake.notified() => {
                    if let Err(e) = self.flush().await {
                        error!("Flush after write failed: {}", e);
                    }
                }
            }
        }
    }

    /// Write every dirty entry to the disk tier in one batch
    ///
    /// Entries are merged into the disk working set before anything leaves
    /// the dirty set, so a queued entry is readable from one of them at all
    /// times. A key leaves the dirty set only once the save succeeded and only
    /// if it was not dirtied again meanwhile; on failure the batch stays queued.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<usize> {
        let _gate = self.gate.lock().await;

        let batch: Vec<CacheEntry> = self
            .pending
            .iter()
            .map(|item| item.value().clone())
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        self.disk.merge(&batch);
        match self.on_disk(|disk| disk.persist()).await {
            Ok(()) => {
                for entry in &batch {
                    self.pending
                        .remove_if(&entry.primary_key(), |_, queued| queued == entry);
                }
                self.metrics.record_flush(batch.len());
                debug!(count = batch.len(), "Flushed dirty entries");
                Ok(batch.len())
            }
            Err(e) => {
                self.metrics.record_flush_failure();
                warn!(count = batch.len(), "Flush failed, entries stay dirty: {}", e);
                Err(e)
            }
        }
    }

    /// Expiry and capacity cleanup of the disk tier
    pub async fn cleanup(&self) {
        let _gate = self.gate.lock().await;
        match self.on_disk(|disk| disk.cleanup()).await {
            Ok(report) if report.removed() > 0 => info!(
                expired = report.expired,
                over_capacity = report.over_capacity,
                "Disk tier cleanup"
            ),
            Ok(_) => {}
            Err(e) => warn!("Disk tier cleanup failed: {}", e),
        }
    }

    /// Drop an entry from the dirty set and the disk tier
    pub async fn remove_entry(&self, primary_key: &str) -> bool {
        let _gate = self.gate.lock().await;
        let was_pending = self.pending.remove(primary_key).is_some();

        let key = primary_key.to_string();
        let on_disk = match self.on_disk(move |disk| disk.remove_entry(&key)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = primary_key, "Failed to persist entry removal: {}", e);
                // Gone from the working set; only the save failed
                true
            }
        };
        was_pending || on_disk
    }

    /// Drop a project from the dirty set and the disk tier; returns the keys removed
    pub async fn remove_project(&self, project_id: &str) -> HashSet<String> {
        let _gate = self.gate.lock().await;

        let mut removed: HashSet<String> = self
            .pending
            .iter()
            .filter(|item| is_project_key(item.key(), project_id))
            .map(|item| item.key().clone())
            .collect();
        for key in &removed {
            self.pending.remove(key);
        }

        let project = project_id.to_string();
        match self
            .on_disk(move |disk| disk.remove_by_project(&project))
            .await
        {
            Ok(keys) => removed.extend(keys),
            Err(e) => warn!(project_id, "Failed to persist project removal: {}", e),
        }
        removed
    }

    /// Drop everything from the dirty set and the disk tier
    pub async fn clear(&self) {
        let _gate = self.gate.lock().await;
        self.pending.clear();
        if let Err(e) = self.on_disk(|disk| disk.clear()).await {
            warn!("Failed to persist cache clear: {}", e);
        }
    }

    /// Stop the worker and flush what is left, within the shutdown budget
    pub async fn shutdown(&self) -> ShutdownReport {
        self.cancel.cancel();
        let worker = self.worker.lock().take();

        let outcome = tokio::time::timeout(self.shutdown_timeout, async {
            if let Some(handle) = worker {
                if let Err(e) = handle.await {
                    warn!("Sync worker ended abnormally: {}", e);
                }
            }
            self.flush().await
        })
        .await;

        let mut report = ShutdownReport::default();
        match outcome {
            Ok(Ok(flushed)) => report.flushed = flushed,
            Ok(Err(e)) => error!("Final flush failed: {}", e),
            Err(_) => {
                report.timed_out = true;
                warn!(
                    "Final flush did not finish within {:?}, exiting anyway",
                    self.shutdown_timeout
                );
            }
        }
        report.pending = self.pending.len();
        info!(
            flushed = report.flushed,
            pending = report.pending,
            "Sync scheduler stopped"
        );
        report
    }

    /// Stop the worker without flushing
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Run a disk tier operation on the blocking pool
    async fn on_disk<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&DiskTier) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let disk = Arc::clone(&self.disk);
        tokio::task::spawn_blocking(move || op(&disk))
            .await
            .map_err(|e| Error::Internal(format!("disk task failed: {}", e)))?
    }
}

// =============================================================================
// Tests
// =============================================================================
