//! Disk Tier - durable document-backed store
//!
//! The whole persisted document is loaded at startup and kept in process
//! memory as the tier's working set. Every mutation rewrites the document
//! through the [`DocumentStore`] it was opened with.
//!
//! # Design
//!
//! - Working set behind a `parking_lot::RwLock`; lookups never touch the store
//! - Index maps are derived data: regenerated from entries at load and for each
//!   written entry
//! - Saves are ordered by a generation counter so a slow writer can never
//!   overwrite a newer document with an older snapshot
//! - Size is bounded by [`DiskTier::cleanup`], not by per-write eviction

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, IndexEntry};
use super::key::IndexKind;
use super::store::{DiskDocument, DocumentStore};
use crate::error::{Error, Result};

/// Disk tier configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Entry time-to-live
    pub ttl: Duration,
    /// Entry bound enforced by cleanup
    pub max_entries: usize,
    /// Fraction of expired entries at load that triggers a rewrite
    pub expired_cleanup_ratio: f64,
}

/// Outcome of loading the persisted document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Entries kept in the working set
    pub loaded: usize,
    /// Entries older than TTL at load time
    pub expired: usize,
    /// Entries dropped because their key disagreed with their metadata
    pub invalid: usize,
    /// Whether expired entries were purged and the document rewritten
    pub cleaned: bool,
    /// Whether the persisted document was unreadable and replaced by an empty one
    pub malformed: bool,
}

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub over_capacity: usize,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.expired + self.over_capacity
    }
}

/// Disk tier over a [`DocumentStore`]
pub struct DiskTier {
    store: Arc<dyn DocumentStore>,
    document: RwLock<DiskDocument>,
    config: DiskConfig,
    /// Bumped on every mutation of the working set
    generation: AtomicU64,
    /// Generation last written to the store
    persisted: Mutex<u64>,
}

impl DiskTier {
    /// Open the tier, loading and validating the persisted document
    ///
    /// A malformed document yields an empty working set. Any other load failure
    /// is returned so the caller can run without a disk tier.
    pub fn open(store: Arc<dyn DocumentStore>, config: DiskConfig) -> Result<(Self, LoadReport)> {
        let mut report = LoadReport::default();

        let document = match store.load() {
            Ok(Some(document)) => document,
            Ok(None) => DiskDocument::default(),
            Err(Error::MalformedDocument { location, reason }) => {
                warn!(%location, %reason, "Cache document is malformed, starting empty");
                report.malformed = true;
                DiskDocument::default()
            }
            Err(e) => return Err(e),
        };

        let (document, invalid) = validate(document);
        report.invalid = invalid;
        report.expired = document
            .entries
            .values()
            .filter(|entry| entry.is_expired(config.ttl))
            .count();

        let tier = Self {
            store,
            document: RwLock::new(document),
            config,
            generation: AtomicU64::new(0),
            persisted: Mutex::new(0),
        };

        let total = tier.len();
        if total > 0 && report.expired as f64 / total as f64 > tier.config.expired_cleanup_ratio {
            match tier.cleanup() {
                Ok(cleanup) => {
                    report.cleaned = true;
                    info!(
                        expired = cleanup.expired,
                        over_capacity = cleanup.over_capacity,
                        "Purged cache document at load"
                    );
                }
                Err(e) => warn!("Failed to purge expired entries at load: {}", e),
            }
        }

        report.loaded = tier.len();
        info!(
            location = %tier.store.location(),
            loaded = report.loaded,
            expired = report.expired,
            invalid = report.invalid,
            "Disk tier opened"
        );
        Ok((tier, report))
    }

    /// Get a non-expired entry by primary key
    pub fn get(&self, primary_key: &str) -> Option<CacheEntry> {
        self.document
            .read()
            .entries
            .get(primary_key)
            .filter(|entry| !entry.is_expired(self.config.ttl))
            .cloned()
    }

    /// Look up a secondary index pointer
    pub fn get_index(&self, kind: IndexKind, key: &str) -> Option<IndexEntry> {
        let document = self.document.read();
        index_map(&document, kind).get(key).cloned()
    }

    /// Drop a stale index pointer from the working set
    ///
    /// Not persisted on its own; the next save carries it.
    pub fn remove_index(&self, kind: IndexKind, key: &str) {
        let mut document = self.document.write();
        if index_map_mut(&mut document, kind).remove(key).is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Merge one entry and persist
    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        self.write_batch(std::slice::from_ref(entry))
    }

    /// Merge a batch of entries and persist the document once
    pub fn write_batch(&self, entries: &[CacheEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.merge(entries);
        self.persist()
    }

    /// Merge entries into the working set without saving
    ///
    /// Merged entries are readable immediately; [`persist`](Self::persist)
    /// writes them out.
    pub fn merge(&self, entries: &[CacheEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut document = self.document.write();
        for entry in entries {
            document.entries.insert(entry.primary_key(), entry.clone());
            document.index(entry);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!(count = entries.len(), "Merged entries into disk tier");
    }

    /// Remove one entry
    ///
    /// URL pointers to the entry are dropped; name and path indexes are reset
    /// wholesale and rebuilt lazily.
    pub fn remove_entry(&self, primary_key: &str) -> Result<bool> {
        let removed = {
            let mut document = self.document.write();
            let removed = document.entries.remove(primary_key).is_some();
            if removed {
                document
                    .url_index
                    .retain(|_, pointer| pointer.primary_key() != primary_key);
                document.name_index.clear();
                document.path_index.clear();
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            removed
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remove every entry of a project; all indexes are reset
    ///
    /// Returns the primary keys removed.
    pub fn remove_by_project(&self, project_id: &str) -> Result<Vec<String>> {
        let removed = {
            let mut document = self.document.write();
            let removed: Vec<String> = document
                .entries
                .iter()
                .filter(|(_, entry)| entry.project_id() == project_id)
                .map(|(key, _)| key.clone())
                .collect();
            if !removed.is_empty() {
                for key in &removed {
                    document.entries.remove(key);
                }
                document.clear_indexes();
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            removed
        };
        if !removed.is_empty() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remove everything
    pub fn clear(&self) -> Result<()> {
        {
            let mut document = self.document.write();
            *document = DiskDocument::default();
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.persist()
    }

    /// Purge expired entries and trim to `max_entries`, oldest first
    ///
    /// Persists only when something was removed.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let report = {
            let mut document = self.document.write();
            let ttl = self.config.ttl;

            let before = document.entries.len();
            document.entries.retain(|_, entry| !entry.is_expired(ttl));
            let expired = before - document.entries.len();

            let mut over_capacity = 0;
            if document.entries.len() > self.config.max_entries {
                let mut by_age: Vec<(chrono::DateTime<chrono::Utc>, String)> = document
                    .entries
                    .iter()
                    .map(|(key, entry)| (entry.cached_at(), key.clone()))
                    .collect();
                by_age.sort();
                over_capacity = document.entries.len() - self.config.max_entries;
                for (_, key) in by_age.into_iter().take(over_capacity) {
                    document.entries.remove(&key);
                }
            }

            let report = CleanupReport {
                expired,
                over_capacity,
            };
            if report.removed() > 0 {
                document.rebuild_indexes();
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            report
        };

        if report.removed() > 0 {
            debug!(
                expired = report.expired,
                over_capacity = report.over_capacity,
                "Disk tier cleanup"
            );
            self.persist()?;
        }
        Ok(report)
    }

    /// Regenerate all index maps from the entries in the working set
    pub fn rebuild_indexes(&self) {
        let mut document = self.document.write();
        document.rebuild_indexes();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Non-expired entries, oldest first
    pub fn fresh_entries(&self) -> Vec<CacheEntry> {
        let document = self.document.read();
        let mut entries: Vec<CacheEntry> = document
            .entries
            .values()
            .filter(|entry| !entry.is_expired(self.config.ttl))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.cached_at());
        entries
    }

    /// Entries physically held, expired ones included
    pub fn len(&self) -> usize {
        self.document.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    pub fn index_len(&self, kind: IndexKind) -> usize {
        index_map(&self.document.read(), kind).len()
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Write the working set if it changed since the last save
    pub fn persist(&self) -> Result<()> {
        let mut persisted = self.persisted.lock();
        let document = self.document.read();
        let generation = self.generation.load(Ordering::Acquire);
        if *persisted >= generation {
            return Ok(());
        }
        self.store.save(&document)?;
        *persisted = generation;
        Ok(())
    }
}

/// Drop entries filed under the wrong key and regenerate the derived indexes
fn validate(mut document: DiskDocument) -> (DiskDocument, usize) {
    let before = document.entries.len();
    document.entries = document
        .entries
        .into_iter()
        .filter(|(stored_key, entry)| {
            let ok = *stored_key == entry.primary_key();
            if !ok {
                warn!(key = %stored_key, "Dropping cache entry filed under the wrong key");
            }
            ok
        })
        .collect::<BTreeMap<_, _>>();
    let invalid = before - document.entries.len();
    document.rebuild_indexes();
    (document, invalid)
}

fn index_map(document: &DiskDocument, kind: IndexKind) -> &BTreeMap<String, IndexEntry> {
    match kind {
        IndexKind::Url => &document.url_index,
        IndexKind::Name => &document.name_index,
        IndexKind::Path => &document.path_index,
    }
}

fn index_map_mut(document: &mut DiskDocument, kind: IndexKind) -> &mut BTreeMap<String, IndexEntry> {
    match kind {
        IndexKind::Url => &mut document.url_index,
        IndexKind::Name => &mut document.name_index,
        IndexKind::Path => &mut document.path_index,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key;
    use crate::cache::store::InMemoryStore;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn config() -> DiskConfig {
        DiskConfig {
            ttl: HOUR,
            max_entries: 100,
            expired_cleanup_ratio: 0.5,
        }
    }

    fn entry(project: &str, id: u64) -> CacheEntry {
        CacheEntry::new(project, id, format!("Op {}", id), format!("/op/{}", id), "get", json!({"id": id}))
            .with_source_url(format!("https://x/{}/{}", project, id))
    }

    fn stale(project: &str, id: u64) -> CacheEntry {
        entry(project, id).with_cached_at(Utc::now() - chrono::Duration::hours(2))
    }

    fn open(store: &Arc<InMemoryStore>) -> (DiskTier, LoadReport) {
        DiskTier::open(store.clone(), config()).unwrap()
    }

    /// Store whose saves always fail
    struct BrokenStore;

    impl DocumentStore for BrokenStore {
        fn load(&self) -> Result<Option<DiskDocument>> {
            Ok(None)
        }
        fn save(&self, _: &DiskDocument) -> Result<()> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
        fn location(&self) -> String {
            "broken".into()
        }
    }

    #[test]
    fn test_open_empty() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, report) = open(&store);
        assert!(tier.is_empty());
        assert_eq!(report, LoadReport::default());
        assert_eq!(tier.capacity(), 100);
    }

    #[test]
    fn test_write_and_get() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);

        let e = entry("1", 42);
        tier.write(&e).unwrap();

        assert_eq!(tier.get("doc:1:42"), Some(e.clone()));
        let pointer = tier
            .get_index(IndexKind::Url, &key::url_key("https://x/1/42"))
            .unwrap();
        assert_eq!(pointer.primary_key(), "doc:1:42");
        assert!(tier
            .get_index(IndexKind::Path, &key::path_key("1", "GET", "/op/42"))
            .is_some());
        assert!(tier
            .get_index(IndexKind::Name, &key::name_key("1", "op 42"))
            .is_some());
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn test_write_batch_saves_once() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);

        let batch: Vec<CacheEntry> = (0..10).map(|i| entry("1", i)).collect();
        tier.write_batch(&batch).unwrap();
        tier.write_batch(&[]).unwrap();

        assert_eq!(tier.len(), 10);
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn test_merge_is_readable_before_persist() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);

        tier.merge(&[entry("1", 1), entry("1", 2)]);
        assert!(tier.get("doc:1:2").is_some());
        assert_eq!(tier.index_len(IndexKind::Path), 2);
        assert_eq!(store.saves(), 0);

        tier.persist().unwrap();
        tier.persist().unwrap();
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot().unwrap().entries.len(), 2);
    }

    #[test]
    fn test_expired_entry_reads_absent() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);
        tier.write(&stale("1", 1)).unwrap();

        assert!(tier.get("doc:1:1").is_none());
        assert_eq!(tier.len(), 1);
        assert!(tier.fresh_entries().is_empty());
    }

    #[test]
    fn test_restart_keeps_fresh_entries() {
        let store = Arc::new(InMemoryStore::new());
        {
            let (tier, _) = open(&store);
            tier.write_batch(&[entry("1", 1), entry("1", 2), stale("1", 3)])
                .unwrap();
        }

        let (tier, report) = open(&store);
        assert_eq!(report.expired, 1);
        assert!(!report.cleaned); // 1/3 is under the 0.5 ratio
        assert!(tier.get("doc:1:1").is_some());
        assert!(tier.get("doc:1:2").is_some());
        assert!(tier.get("doc:1:3").is_none());
    }

    #[test]
    fn test_load_purges_when_mostly_expired() {
        let store = Arc::new(InMemoryStore::new());
        {
            let (tier, _) = open(&store);
            tier.write_batch(&[entry("1", 1), stale("1", 2), stale("1", 3)])
                .unwrap();
        }

        let (tier, report) = open(&store);
        assert!(report.cleaned);
        assert_eq!(report.expired, 2);
        assert_eq!(report.loaded, 1);
        assert_eq!(store.snapshot().unwrap().entries.len(), 1);
        assert_eq!(tier.index_len(IndexKind::Url), 1);
    }

    #[test]
    fn test_malformed_document_starts_empty() {
        let store = Arc::new(InMemoryStore::with_raw(r#"{"entries": 5}"#));
        let (tier, report) = open(&store);
        assert!(report.malformed);
        assert!(tier.is_empty());

        // The next write replaces the bad document
        tier.write(&entry("1", 1)).unwrap();
        assert_eq!(store.snapshot().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_misfiled_entries_dropped_and_indexes_regenerated() {
        let mut doc = DiskDocument::default();
        doc.entries.insert("doc:1:999".into(), entry("1", 1));
        doc.entries.insert("doc:1:2".into(), entry("1", 2));
        doc.name_index.insert("name:1:ghost".into(), IndexEntry::new("1", 77));
        let store = Arc::new(InMemoryStore::new());
        store.save(&doc).unwrap();

        let (tier, report) = open(&store);
        assert_eq!(report.invalid, 1);
        assert_eq!(tier.len(), 1);
        assert!(tier.get_index(IndexKind::Name, "name:1:ghost").is_none());
        assert_eq!(tier.index_len(IndexKind::Name), 1);
    }

    #[test]
    fn test_remove_entry_resets_name_and_path_indexes() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);
        tier.write_batch(&[entry("1", 1), entry("1", 2)]).unwrap();

        assert!(tier.remove_entry("doc:1:1").unwrap());
        assert!(!tier.remove_entry("doc:1:1").unwrap());

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.index_len(IndexKind::Url), 1);
        assert_eq!(tier.index_len(IndexKind::Name), 0);
        assert_eq!(tier.index_len(IndexKind::Path), 0);

        tier.rebuild_indexes();
        assert_eq!(tier.index_len(IndexKind::Name), 1);
    }

    #[test]
    fn test_remove_by_project() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);
        tier.write_batch(&[entry("1", 1), entry("1", 2), entry("2", 1)])
            .unwrap();

        assert_eq!(
            tier.remove_by_project("1").unwrap(),
            vec!["doc:1:1".to_string(), "doc:1:2".to_string()]
        );
        assert!(tier.remove_by_project("1").unwrap().is_empty());
        assert!(tier.get("doc:2:1").is_some());
        assert_eq!(tier.index_len(IndexKind::Url), 0);
        assert_eq!(store.snapshot().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_clear() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);
        tier.write(&entry("1", 1)).unwrap();
        tier.clear().unwrap();
        assert!(tier.is_empty());
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_trims_oldest() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = DiskTier::open(
            store.clone(),
            DiskConfig {
                max_entries: 2,
                ..config()
            },
        )
        .unwrap();

        let now = Utc::now();
        tier.write_batch(&[
            entry("1", 1).with_cached_at(now - chrono::Duration::minutes(3)),
            entry("1", 2).with_cached_at(now - chrono::Duration::minutes(2)),
            entry("1", 3).with_cached_at(now - chrono::Duration::minutes(1)),
            stale("1", 4),
        ])
        .unwrap();

        let report = tier.cleanup().unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.over_capacity, 1);
        assert!(tier.get("doc:1:1").is_none());
        assert!(tier.get("doc:1:3").is_some());
        assert_eq!(tier.index_len(IndexKind::Path), 2);

        let saves = store.saves();
        assert_eq!(tier.cleanup().unwrap().removed(), 0);
        assert_eq!(store.saves(), saves);
    }

    #[test]
    fn test_save_failure_propagates_but_keeps_working_set() {
        let (tier, _) = DiskTier::open(Arc::new(BrokenStore), config()).unwrap();
        assert_matches!(tier.write(&entry("1", 1)), Err(Error::Io(_)));
        assert!(tier.get("doc:1:1").is_some());
    }

    #[test]
    fn test_fresh_entries_oldest_first() {
        let store = Arc::new(InMemoryStore::new());
        let (tier, _) = open(&store);
        let now = Utc::now();
        tier.write_batch(&[
            entry("1", 1).with_cached_at(now),
            entry("1", 2).with_cached_at(now - chrono::Duration::minutes(5)),
        ])
        .unwrap();

        let ids: Vec<u64> = tier.fresh_entries().iter().map(|e| e.metadata.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
