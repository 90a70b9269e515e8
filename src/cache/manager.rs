//! Cache Manager - Hybrid Two-Tier Cache
//!
//! Coordinates the memory tier, the disk tier and the sync scheduler behind
//! one lookup API. Memory is consulted first; disk hits are copied back into
//! memory so the next lookup is served from RAM.
//!
//! # Design
//!
//! - Entries live under their primary key; url, name and path lookups go
//!   through separate index tiers that hold pointers, never documents
//! - Writes land in memory and are queued for the disk tier; nothing on the
//!   write path waits for I/O
//! - An index pointer that no longer resolves is dropped from both tiers
//! - Clears purge the dirty set and disk first and memory last, so a lookup
//!   racing a clear cannot copy a cleared entry back up
//! - Clears reset name and path indexes wholesale and mark them stale; the
//!   next index miss rebuilds them from the entries
//! - Disk tier failures at startup degrade to a memory-only cache

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::disk::{DiskConfig, DiskTier};
use super::entry::{CacheEntry, IndexEntry};
use super::key::{self, IndexKind};
use super::memory::MemoryTier;
use super::metrics::{CacheMetrics, DiskStats, IndexStats, MemoryStats, StatsSnapshot, SyncStats};
use super::origin::{FetchRequest, OriginFetcher};
use super::store::{DocumentStore, JsonFileStore};
use super::sync::{ShutdownReport, SyncScheduler};
use crate::config::CacheConfig;
use crate::error::Result;

/// Tier that served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Process memory
    Memory,
    /// Persisted document
    Disk,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Disk => write!(f, "disk"),
        }
    }
}

/// Cache lookup result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// The cached entry
    pub entry: CacheEntry,
    /// Which tier the entry was found in
    pub tier: CacheTier,
}

/// Result of a read-through lookup
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub entry: CacheEntry,
    /// Serving tier, or `None` when the origin was called
    pub tier: Option<CacheTier>,
}

/// Hybrid memory + disk cache for schema documents
pub struct HybridCache {
    config: CacheConfig,

    entries: MemoryTier<CacheEntry>,
    url_index: MemoryTier<IndexEntry>,
    name_index: MemoryTier<IndexEntry>,
    path_index: MemoryTier<IndexEntry>,

    disk: Option<Arc<DiskTier>>,
    sync: Option<Arc<SyncScheduler>>,

    metrics: Arc<CacheMetrics>,

    /// Name/path indexes were reset and need regenerating on the next miss
    indexes_stale: AtomicBool,
    /// Bumped by every clear once the lower tiers are purged
    clear_epoch: AtomicU64,
}

impl HybridCache {
    /// Create a cache with the disk tier at the configured location
    ///
    /// Must be called from within a Tokio runtime for background sync to run.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        if !config.enabled || !config.persistent_enabled {
            return Ok(Self::build(config, None));
        }

        let store = config
            .resolve_disk_path()
            .and_then(JsonFileStore::open);
        match store {
            Ok(store) => Self::with_store(config, Arc::new(store)),
            Err(e) => {
                warn!("Disk tier unavailable, running memory-only: {}", e);
                Ok(Self::build(config, None))
            }
        }
    }

    /// Create a cache whose disk tier is backed by `store`
    pub fn with_store(config: CacheConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        config.validate()?;
        if !config.enabled || !config.persistent_enabled {
            return Ok(Self::build(config, None));
        }

        let disk_config = DiskConfig {
            ttl: config.ttl(),
            max_entries: config.disk_max_entries,
            expired_cleanup_ratio: config.expired_cleanup_ratio,
        };
        let disk = match DiskTier::open(store, disk_config) {
            Ok((disk, _)) => Some(Arc::new(disk)),
            Err(e) => {
                warn!("Failed to open disk tier, running memory-only: {}", e);
                None
            }
        };
        Ok(Self::build(config, disk))
    }

    /// Create a cache without a disk tier
    pub fn memory_only(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    fn build(config: CacheConfig, disk: Option<Arc<DiskTier>>) -> Self {
        let ttl = config.ttl();
        let index_capacity = config.index_capacity();
        let metrics = Arc::new(CacheMetrics::new());

        let sync = disk.as_ref().map(|disk| {
            let scheduler = SyncScheduler::new(
                Arc::clone(disk),
                Arc::clone(&metrics),
                config.sync_interval(),
                config.shutdown_timeout(),
            );
            scheduler.start();
            scheduler
        });

        let cache = Self {
            entries: MemoryTier::new("entries", config.memory_max_entries, ttl),
            url_index: MemoryTier::new("url-index", index_capacity, ttl),
            name_index: MemoryTier::new("name-index", index_capacity, ttl),
            path_index: MemoryTier::new("path-index", index_capacity, ttl),
            disk,
            sync,
            metrics,
            indexes_stale: AtomicBool::new(false),
            clear_epoch: AtomicU64::new(0),
            config,
        };
        cache.warm();

        info!(
            enabled = cache.config.enabled,
            persistent = cache.is_persistent(),
            memory_max = cache.config.memory_max_entries,
            "Schema cache ready"
        );
        cache
    }

    /// Load fresh disk entries into memory, most recent last so they survive
    fn warm(&self) {
        let Some(disk) = &self.disk else {
            return;
        };
        let fresh = disk.fresh_entries();
        if fresh.is_empty() {
            return;
        }
        let count = fresh.len();
        for entry in fresh {
            self.insert_memory(entry);
        }
        debug!(count, "Warmed memory tier from disk");
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store an entry in memory and queue it for the disk tier
    pub fn put(&self, entry: CacheEntry) {
        if !self.config.enabled {
            return;
        }
        debug!(key = %entry.primary_key(), "Caching entry");
        if let Some(sync) = &self.sync {
            sync.mark_dirty(entry.clone());
        }
        self.insert_memory(entry);
    }

    /// Insert into the memory entry and index tiers without queueing
    fn insert_memory(&self, entry: CacheEntry) {
        let cached_at = entry.cached_at();
        let pointer = entry.metadata.index_entry();

        if let Some(url_key) = entry.metadata.url_key() {
            self.url_index.put(url_key, pointer.clone(), cached_at);
        }
        self.name_index
            .put(entry.metadata.name_key(), pointer.clone(), cached_at);
        self.path_index
            .put(entry.metadata.path_key(), pointer, cached_at);

        if let Some((evicted, _)) = self.entries.put(entry.primary_key(), entry, cached_at) {
            debug!(key = %evicted, "Evicted from memory tier");
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Look up by project and document id
    pub fn get_by_primary(&self, project_id: &str, id: u64) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let hit = self.resolve_primary(&key::primary_key(project_id, id));
        self.record(hit.as_ref());
        hit
    }

    /// Look up by the document's source URL
    pub fn get_by_url(&self, url: &str) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let hit = self.lookup_index(IndexKind::Url, &key::url_key(url));
        self.record(hit.as_ref());
        hit
    }

    /// Look up by endpoint name, falling back to a substring scan of memory
    ///
    /// The scan matches the query against entry names and paths of the same
    /// project, case-insensitively, most recently used first.
    pub fn get_by_name(&self, project_id: &str, name: &str) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let hit = self
            .lookup_index(IndexKind::Name, &key::name_key(project_id, name))
            .or_else(|| self.fuzzy_by_name(project_id, name));
        self.record(hit.as_ref());
        hit
    }

    /// Look up by HTTP method and path
    pub fn get_by_path(&self, project_id: &str, method: &str, path: &str) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let hit = self.lookup_index(IndexKind::Path, &key::path_key(project_id, method, path));
        self.record(hit.as_ref());
        hit
    }

    fn record(&self, hit: Option<&CacheHit>) {
        match hit.map(|hit| hit.tier) {
            Some(CacheTier::Memory) => self.metrics.record_memory_hit(),
            Some(CacheTier::Disk) => self.metrics.record_disk_hit(),
            None => self.metrics.record_memory_miss(),
        }
    }

    /// Resolve a primary key: memory, then queued writes, then disk
    fn resolve_primary(&self, primary_key: &str) -> Option<CacheHit> {
        if let Some(entry) = self.entries.get(primary_key) {
            return Some(CacheHit {
                entry,
                tier: CacheTier::Memory,
            });
        }

        let epoch = self.clear_epoch.load(Ordering::SeqCst);

        // Evicted from memory before its flush
        let queued = self
            .sync
            .as_ref()
            .and_then(|sync| sync.pending_entry(primary_key))
            .filter(|entry| !entry.is_expired(self.config.ttl()));
        let entry = match queued {
            Some(entry) => entry,
            None => self.disk.as_ref()?.get(primary_key)?,
        };

        self.insert_memory(entry.clone());
        if self.clear_epoch.load(Ordering::SeqCst) != epoch && !self.held_below_memory(primary_key) {
            // Cleared while being copied up
            self.entries.remove(primary_key);
            return None;
        }
        self.metrics.record_backfill();
        Some(CacheHit {
            entry,
            tier: CacheTier::Disk,
        })
    }

    /// Whether the dirty set or the disk tier still holds `primary_key`
    fn held_below_memory(&self, primary_key: &str) -> bool {
        let queued = self
            .sync
            .as_ref()
            .is_some_and(|sync| sync.pending_entry(primary_key).is_some());
        queued
            || self
                .disk
                .as_ref()
                .is_some_and(|disk| disk.get(primary_key).is_some())
    }

    /// Index lookup with one retry after a pending index rebuild
    fn lookup_index(&self, kind: IndexKind, index_key: &str) -> Option<CacheHit> {
        if let Some(hit) = self.resolve_index(kind, index_key) {
            return Some(hit);
        }
        if self.indexes_stale.swap(false, Ordering::AcqRel) {
            self.rebuild_indexes();
            return self.resolve_index(kind, index_key);
        }
        None
    }

    fn resolve_index(&self, kind: IndexKind, index_key: &str) -> Option<CacheHit> {
        let memory = self.index_tier(kind);

        if let Some(pointer) = memory.get(index_key) {
            if let Some(hit) = self.resolve_primary(&pointer.primary_key()) {
                return Some(hit);
            }
            memory.remove(index_key);
            self.metrics.record_stale_index();
            debug!(%kind, key = index_key, "Dropped stale memory index pointer");
        }

        let disk = self.disk.as_ref()?;
        let pointer = disk.get_index(kind, index_key)?;
        match self.resolve_primary(&pointer.primary_key()) {
            Some(hit) => {
                memory.put(index_key.to_string(), pointer, hit.entry.cached_at());
                Some(hit)
            }
            None => {
                disk.remove_index(kind, index_key);
                self.metrics.record_stale_index();
                debug!(%kind, key = index_key, "Dropped stale disk index pointer");
                None
            }
        }
    }

    fn fuzzy_by_name(&self, project_id: &str, query: &str) -> Option<CacheHit> {
        let query = key::normalize_name(query);
        if query.is_empty() {
            return None;
        }

        let primary_key = self.entries.find_key(|_, entry| {
            entry.project_id() == project_id
                && (entry.metadata.name.to_lowercase().contains(&query)
                    || entry.metadata.path.to_lowercase().contains(&query))
        })?;

        // get() refreshes recency of the match
        let entry = self.entries.get(&primary_key)?;
        debug!(key = %primary_key, query = %query, "Fuzzy name match");
        Some(CacheHit {
            entry,
            tier: CacheTier::Memory,
        })
    }

    /// Regenerate memory and disk indexes from the entries each tier holds
    fn rebuild_indexes(&self) {
        for (_, entry) in self.entries.values() {
            let cached_at = entry.cached_at();
            let pointer = entry.metadata.index_entry();
            if let Some(url_key) = entry.metadata.url_key() {
                self.url_index.put(url_key, pointer.clone(), cached_at);
            }
            self.name_index
                .put(entry.metadata.name_key(), pointer.clone(), cached_at);
            self.path_index
                .put(entry.metadata.path_key(), pointer, cached_at);
        }
        if let Some(disk) = &self.disk {
            disk.rebuild_indexes();
        }
        self.metrics.record_index_rebuild();
        debug!("Rebuilt secondary indexes");
    }

    fn index_tier(&self, kind: IndexKind) -> &MemoryTier<IndexEntry> {
        match kind {
            IndexKind::Url => &self.url_index,
            IndexKind::Name => &self.name_index,
            IndexKind::Path => &self.path_index,
        }
    }

    // =========================================================================
    // Read-through
    // =========================================================================

    /// Serve from cache, or fetch from the origin and cache the result
    pub async fn get_or_fetch(
        &self,
        request: FetchRequest,
        origin: &dyn OriginFetcher,
    ) -> Result<Fetched> {
        if let Some(hit) = self.get_by_primary(&request.project_id, request.id) {
            return Ok(Fetched {
                entry: hit.entry,
                tier: Some(hit.tier),
            });
        }
        let entry = self.refresh(request, origin).await?;
        Ok(Fetched { entry, tier: None })
    }

    /// Fetch from the origin unconditionally and replace the cached entry
    pub async fn refresh(&self, request: FetchRequest, origin: &dyn OriginFetcher) -> Result<CacheEntry> {
        let document = origin.fetch(&request.project_id, &request.scope).await?;
        let entry = request.into_entry(document);
        self.put(entry.clone());
        Ok(entry)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove one entry from both tiers
    ///
    /// Returns whether anything was removed.
    pub async fn clear_one(&self, primary_key: &str) -> bool {
        let below = match &self.sync {
            Some(sync) => sync.remove_entry(primary_key).await,
            None => false,
        };
        self.clear_epoch.fetch_add(1, Ordering::SeqCst);

        let in_memory = self.entries.remove(primary_key).is_some();
        self.url_index
            .retain(|_, pointer| pointer.primary_key() != primary_key);
        self.name_index.clear();
        self.path_index.clear();
        self.indexes_stale.store(true, Ordering::Release);

        let removed = in_memory || below;
        info!(key = primary_key, removed, "Cleared cache entry");
        removed
    }

    /// Remove every entry of a project from both tiers
    ///
    /// Returns the number of distinct entries removed.
    pub async fn clear_project(&self, project_id: &str) -> usize {
        let mut removed: HashSet<String> = match &self.sync {
            Some(sync) => sync.remove_project(project_id).await,
            None => HashSet::new(),
        };
        self.clear_epoch.fetch_add(1, Ordering::SeqCst);

        self.entries.retain(|primary_key, _| {
            if key::is_project_key(primary_key, project_id) {
                removed.insert(primary_key.to_string());
                false
            } else {
                true
            }
        });
        for kind in IndexKind::ALL {
            self.index_tier(kind).clear();
        }
        self.indexes_stale.store(true, Ordering::Release);

        info!(project_id, removed = removed.len(), "Cleared project");
        removed.len()
    }

    /// Remove everything from both tiers
    pub async fn clear_all(&self) {
        if let Some(sync) = &self.sync {
            sync.clear().await;
        }
        self.clear_epoch.fetch_add(1, Ordering::SeqCst);
        self.clear_memory();
        self.indexes_stale.store(false, Ordering::Release);
        info!("Cleared cache");
    }

    /// Drop the memory tier only, as after a process restart
    pub fn clear_memory(&self) {
        self.entries.clear();
        for kind in IndexKind::ALL {
            self.index_tier(kind).clear();
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Write queued entries to disk now
    pub async fn flush(&self) -> Result<usize> {
        match &self.sync {
            Some(sync) => sync.flush().await,
            None => Ok(0),
        }
    }

    /// Stop background sync and flush what is left
    pub async fn shutdown(&self) -> ShutdownReport {
        match &self.sync {
            Some(sync) => sync.shutdown().await,
            None => ShutdownReport::default(),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current statistics
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory: MemoryStats {
                size: self.entries.len(),
                max: self.entries.capacity(),
                hits: self.metrics.memory_hits(),
                misses: self.metrics.memory_misses(),
                evictions: self.entries.evictions(),
            },
            disk: self.disk.as_ref().map(|disk| DiskStats {
                size: disk.len(),
                max: disk.capacity(),
                hits: self.metrics.disk_hits(),
                location: disk.location(),
            }),
            indexes: IndexStats {
                url: self.url_index.len(),
                name: self.name_index.len(),
                path: self.path_index.len(),
            },
            sync: SyncStats {
                pending: self.sync.as_ref().map_or(0, |sync| sync.pending_len()),
                flushes: self.metrics.flushes(),
                flushed_entries: self.metrics.flushed_entries(),
                failures: self.metrics.flush_failures(),
            },
            hit_ratio: self.metrics.hit_ratio(),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether a disk tier is active
    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Location of the disk tier, when active
    pub fn disk_location(&self) -> Option<String> {
        self.disk.as_ref().map(|disk| disk.location())
    }
}

impl Drop for HybridCache {
    fn drop(&mut self) {
        if let Some(sync) = &self.sync {
            let pending = sync.pending_len();
            if pending > 0 {
                warn!(pending, "Cache dropped without shutdown, unflushed entries lost");
            }
            sync.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
