//! schema-cache - Hybrid Cache for API Schema Documents
//!
//! Caches exported OpenAPI documents in a bounded memory tier backed by a
//! persisted JSON document, so repeated lookups skip the export API.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ HybridCache ──▶ Memory Tier ──▶ Disk Tier ──▶ OriginFetcher
//!                 │                              ▲
//!                 └──── dirty set ── Sync Scheduler
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, key codec, sync scheduler and the lookup coordinator
//! - [`config`] - Cache configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheHit, CacheTier, FetchRequest, HybridCache, OriginFetcher, StatsSnapshot};
pub use config::CacheConfig;
pub use error::{Error, Result};
