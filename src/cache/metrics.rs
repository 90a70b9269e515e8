//! Cache Metrics Collection
//!
//! Hit/miss counters per tier plus sync worker counters. Occupancy is read
//! from the tiers at snapshot time.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    memory_hits: AtomicU64,
    // Terminal "not found": counted once per failed lookup, even when disk was consulted
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,

    backfills: AtomicU64,
    stale_index_removals: AtomicU64,
    index_rebuilds: AtomicU64,

    flushes: AtomicU64,
    flushed_entries: AtomicU64,
    flush_failures: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill(&self) {
        self.backfills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_index(&self) {
        self.stale_index_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_rebuild(&self) {
        self.index_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, entries: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_entries
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn memory_misses(&self) -> u64 {
        self.memory_misses.load(Ordering::Relaxed)
    }

    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn backfills(&self) -> u64 {
        self.backfills.load(Ordering::Relaxed)
    }

    pub fn stale_index_removals(&self) -> u64 {
        self.stale_index_removals.load(Ordering::Relaxed)
    }

    pub fn index_rebuilds(&self) -> u64 {
        self.index_rebuilds.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn flushed_entries(&self) -> u64 {
        self.flushed_entries.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    /// Hits over all resolutions
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.memory_hits() + self.disk_hits()) as f64;
        let total = hits + self.memory_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.memory_misses,
            &self.disk_hits,
            &self.backfills,
            &self.stale_index_removals,
            &self.index_rebuilds,
            &self.flushes,
            &self.flushed_entries,
            &self.flush_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time statistics for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub memory: MemoryStats,
    /// Absent when the disk tier is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskStats>,
    pub indexes: IndexStats,
    pub sync: SyncStats,
    pub hit_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub size: usize,
    pub max: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStats {
    pub size: usize,
    pub max: usize,
    pub hits: u64,
    pub location: String,
}

/// Memory-tier index occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub url: usize,
    pub name: usize,
    pub path: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Dirty entries awaiting flush
    pub pending: usize,
    pub flushes: u64,
    pub flushed_entries: u64,
    pub failures: u64,
}

// =============================================================================
// Tests
// =============================================================================
