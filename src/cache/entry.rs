//! Cache Entry Types
//!
//! A cached schema document, the metadata every index is derived from, and
//! the pointer type stored in the secondary indexes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key;

/// Metadata describing a cached document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Document id within the project
    pub id: u64,
    /// Owning project
    pub project_id: String,
    /// Human-readable name (endpoint summary)
    pub name: String,
    /// Endpoint path, kept verbatim
    pub path: String,
    /// HTTP method
    pub method: String,
    /// URL the document was requested through, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// When the document was fetched from the origin
    pub cached_at: DateTime<Utc>,
}

impl EntryMetadata {
    pub fn primary_key(&self) -> String {
        key::primary_key(&self.project_id, self.id)
    }

    pub fn url_key(&self) -> Option<String> {
        self.source_url.as_deref().map(key::url_key)
    }

    pub fn name_key(&self) -> String {
        key::name_key(&self.project_id, &self.name)
    }

    pub fn path_key(&self) -> String {
        key::path_key(&self.project_id, &self.method, &self.path)
    }

    /// Pointer to this entry for the secondary indexes
    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            project_id: self.project_id.clone(),
            id: self.id,
        }
    }
}

/// Cache entry containing the document and its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Opaque schema document
    pub document: Value,
    /// Entry metadata
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new entry stamped with the current time
    pub fn new(
        project_id: impl Into<String>,
        id: u64,
        name: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
        document: Value,
    ) -> Self {
        Self {
            document,
            metadata: EntryMetadata {
                id,
                project_id: project_id.into(),
                name: name.into(),
                path: path.into(),
                method: method.into(),
                source_url: None,
                cached_at: Utc::now(),
            },
        }
    }

    /// Attach the URL the document was requested through
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.metadata.source_url = Some(url.into());
        self
    }

    /// Override the fetch timestamp
    pub fn with_cached_at(mut self, cached_at: DateTime<Utc>) -> Self {
        self.metadata.cached_at = cached_at;
        self
    }

    #[inline]
    pub fn primary_key(&self) -> String {
        self.metadata.primary_key()
    }

    #[inline]
    pub fn project_id(&self) -> &str {
        &self.metadata.project_id
    }

    #[inline]
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.metadata.cached_at
    }

    /// Check if the entry is older than `ttl`
    #[inline]
    pub fn is_expired(&self, ttl: Duration) -> bool {
        is_expired(self.metadata.cached_at, ttl)
    }
}

/// Secondary index value: points at a primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub project_id: String,
    pub id: u64,
}

impl IndexEntry {
    pub fn new(project_id: impl Into<String>, id: u64) -> Self {
        Self {
            project_id: project_id.into(),
            id,
        }
    }

    #[inline]
    pub fn primary_key(&self) -> String {
        key::primary_key(&self.project_id, self.id)
    }
}

/// Expiry check shared by both tiers
///
/// A timestamp in the future (clock skew) counts as fresh.
pub fn is_expired(cached_at: DateTime<Utc>, ttl: Duration) -> bool {
    match Utc::now().signed_duration_since(cached_at).to_std() {
        Ok(age) => age > ttl,
        Err(_) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
