//! Origin Fetch Port
//!
//! The cache never talks to the schema-export API itself; callers hand it an
//! [`OriginFetcher`] for read-through lookups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::entry::CacheEntry;
use super::metadata;
use crate::error::{Error, Result};

/// Source of fresh documents on a cache miss
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Fetch the document for `project_id`, narrowed by `scope`
    async fn fetch(&self, project_id: &str, scope: &Value) -> Result<Value>;
}

/// A read-through request
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub project_id: String,
    pub id: u64,
    /// Opaque scope descriptor forwarded to the origin
    pub scope: Value,
    pub source_url: Option<String>,
    pub name: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
}

impl FetchRequest {
    pub fn new(project_id: impl Into<String>, id: u64, scope: Value) -> Self {
        Self {
            project_id: project_id.into(),
            id,
            scope,
            source_url: None,
            name: None,
            path: None,
            method: None,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_endpoint(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self.path = Some(path.into());
        self
    }

    /// Build the cache entry for a freshly fetched document
    ///
    /// Fields the request leaves out are inferred from the document.
    pub fn into_entry(self, document: Value) -> CacheEntry {
        let inferred = metadata::infer(&document);
        let name = self
            .name
            .or(inferred.name)
            .unwrap_or_else(|| format!("{}", self.id));
        let path = self.path.or(inferred.path).unwrap_or_default();
        let method = self
            .method
            .or(inferred.method)
            .unwrap_or_else(|| "GET".to_string());

        let entry = CacheEntry::new(self.project_id, self.id, name, path, method, document);
        match self.source_url {
            Some(url) => entry.with_source_url(url),
            None => entry,
        }
    }
}

/// Fetcher serving canned documents keyed by project, counting calls
///
/// Used by tests and by the CLI's dry runs.
#[derive(Debug, Default)]
pub struct StaticOrigin {
    documents: Mutex<HashMap<String, Value>>,
    calls: AtomicU64,
}

impl StaticOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: impl Into<String>, document: Value) {
        self.documents.lock().insert(project_id.into(), document);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OriginFetcher for StaticOrigin {
    async fn fetch(&self, project_id: &str, _scope: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.documents
            .lock()
            .get(project_id)
            .cloned()
            .ok_or_else(|| Error::Origin {
                project_id: project_id.to_string(),
                reason: "no document".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_into_entry_prefers_request_fields() {
        let doc = json!({"paths": {"/a": {"get": {"summary": "Inferred"}}}});
        let entry = FetchRequest::new("1", 5, json!({}))
            .with_name("Explicit")
            .with_endpoint("post", "/b")
            .with_source_url("https://x/1/5")
            .into_entry(doc);

        assert_eq!(entry.metadata.name, "Explicit");
        assert_eq!(entry.metadata.path, "/b");
        assert_eq!(entry.metadata.method, "post");
        assert_eq!(entry.metadata.source_url.as_deref(), Some("https://x/1/5"));
    }

    #[test]
    fn test_into_entry_infers_missing_fields() {
        let doc = json!({"paths": {"/user/profile": {"get": {"summary": "Get User Profile"}}}});
        let entry = FetchRequest::new("1", 6, json!({})).into_entry(doc);

        assert_eq!(entry.metadata.name, "Get User Profile");
        assert_eq!(entry.metadata.path, "/user/profile");
        assert_eq!(entry.metadata.method, "GET");
        assert!(entry.metadata.source_url.is_none());
    }

    #[test]
    fn test_into_entry_defaults() {
        let entry = FetchRequest::new("1", 9, json!({})).into_entry(json!({}));
        assert_eq!(entry.metadata.name, "9");
        assert_eq!(entry.metadata.path, "");
        assert_eq!(entry.metadata.method, "GET");
    }

    #[tokio::test]
    async fn test_static_origin() {
        let origin = StaticOrigin::new();
        origin.insert("1", json!({"ok": true}));

        assert_eq!(origin.fetch("1", &json!({})).await.unwrap(), json!({"ok": true}));
        assert_matches!(origin.fetch("2", &json!({})).await, Err(Error::Origin { .. }));
        assert_eq!(origin.calls(), 2);
    }
}
