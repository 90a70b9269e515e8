//! Persisted Document Stores
//!
//! The disk tier keeps its state in one structured document with four maps.
//! Where that document lives is pluggable: a JSON file in the user's
//! configuration directory in production, an in-memory buffer in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::{CacheEntry, IndexEntry};
use crate::error::{Error, Result};

/// The persisted cache document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDocument {
    /// Primary key -> entry
    #[serde(default)]
    pub entries: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    pub url_index: BTreeMap<String, IndexEntry>,
    #[serde(default)]
    pub name_index: BTreeMap<String, IndexEntry>,
    #[serde(default)]
    pub path_index: BTreeMap<String, IndexEntry>,
}

impl DiskDocument {
    /// Point the three secondary indexes at `entry`
    pub fn index(&mut self, entry: &CacheEntry) {
        let pointer = entry.metadata.index_entry();
        if let Some(url_key) = entry.metadata.url_key() {
            self.url_index.insert(url_key, pointer.clone());
        }
        self.name_index
            .insert(entry.metadata.name_key(), pointer.clone());
        self.path_index.insert(entry.metadata.path_key(), pointer);
    }

    /// Regenerate every index from the entries map
    pub fn rebuild_indexes(&mut self) {
        self.clear_indexes();
        let entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        for entry in &entries {
            self.index(entry);
        }
    }

    pub fn clear_indexes(&mut self) {
        self.url_index.clear();
        self.name_index.clear();
        self.path_index.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Backing store for the disk tier
///
/// Implementations move whole documents; there are no partial writes.
pub trait DocumentStore: Send + Sync {
    /// Load the document; `Ok(None)` when nothing has been persisted yet
    fn load(&self) -> Result<Option<DiskDocument>>;

    /// Replace the persisted document
    fn save(&self, document: &DiskDocument) -> Result<()>;

    /// Human-readable location for logs
    fn location(&self) -> String;
}

/// JSON file store
///
/// Writes go to a sibling temp file and are renamed into place so a crash
/// mid-write never leaves a truncated document behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open a store at `path`, creating the parent directory
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::DiskUnavailable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl DocumentStore for JsonFileStore {
    fn load(&self) -> Result<Option<DiskDocument>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        parse_document(&raw, &self.location()).map(Some)
    }

    fn save(&self, document: &DiskDocument) -> Result<()> {
        let raw = serde_json::to_vec(document)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = raw.len(), "saved cache document");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Store that keeps the serialized document in memory
///
/// The bytes survive the disk tier that wrote them, so building a new tier
/// over the same store behaves like a process restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    raw: Mutex<Option<Vec<u8>>>,
    saves: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw bytes, valid or not
    pub fn with_raw(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
            saves: AtomicU64::new(0),
        }
    }

    /// Number of successful saves
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Decode what is currently persisted
    pub fn snapshot(&self) -> Option<DiskDocument> {
        self.load().ok().flatten()
    }
}

impl DocumentStore for InMemoryStore {
    fn load(&self) -> Result<Option<DiskDocument>> {
        match self.raw.lock().as_deref() {
            Some(raw) => parse_document(raw, &self.location()).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, document: &DiskDocument) -> Result<()> {
        let raw = serde_json::to_vec(document)?;
        *self.raw.lock() = Some(raw);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

fn parse_document(raw: &[u8], location: &str) -> Result<DiskDocument> {
    serde_json::from_slice(raw).map_err(|e| Error::MalformedDocument {
        location: location.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(id: u64) -> CacheEntry {
        CacheEntry::new("1", id, format!("Op {}", id), format!("/op/{}", id), "GET", json!({"id": id}))
            .with_source_url(format!("https://x/1/{}", id))
    }

    fn document_with(ids: &[u64]) -> DiskDocument {
        let mut doc = DiskDocument::default();
        for &id in ids {
            let e = entry(id);
            doc.entries.insert(e.primary_key(), e.clone());
            doc.index(&e);
        }
        doc
    }

    #[test]
    fn test_document_layout() {
        let value = serde_json::to_value(document_with(&[1])).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("entries"));
        assert!(object.contains_key("urlIndex"));
        assert!(object.contains_key("nameIndex"));
        assert!(object.contains_key("pathIndex"));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let doc: DiskDocument = serde_json::from_str(r#"{"entries": {}}"#).unwrap();
        assert!(doc.is_empty());
        assert!(doc.url_index.is_empty());
    }

    #[test]
    fn test_rebuild_indexes() {
        let mut doc = document_with(&[1, 2]);
        doc.url_index.insert("url:dangling".into(), IndexEntry::new("9", 9));
        doc.rebuild_indexes();
        assert_eq!(doc.url_index.len(), 2);
        assert_eq!(doc.name_index.len(), 2);
        assert_eq!(doc.path_index.len(), 2);
        assert!(!doc.url_index.contains_key("url:dangling"));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("nested").join("cache.json")).unwrap();

        assert!(store.load().unwrap().is_none());

        let doc = document_with(&[1, 2, 3]);
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), Some(doc));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_file_store_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"[1, 2, 3]").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_matches!(store.load(), Err(Error::MalformedDocument { .. }));
    }

    #[test]
    fn test_file_store_blank_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"  \n").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_file_store_unwritable_parent() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let result = JsonFileStore::open(blocker.join("cache.json"));
        assert_matches!(result, Err(Error::DiskUnavailable { .. }));
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&document_with(&[7])).unwrap();
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot().unwrap().entries.len(), 1);

        let garbage = InMemoryStore::with_raw("{not json");
        assert_matches!(garbage.load(), Err(Error::MalformedDocument { .. }));
    }
}
