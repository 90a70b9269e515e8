//! Hybrid Schema Document Cache
//!
//! Two-tier cache for exported API schema documents: a bounded in-process
//! memory tier in front of a persisted JSON document.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        HybridCache                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Memory Tier (LRU + TTL)          │  Disk Tier (cache.json)   │
//! │  ┌──────────┐ ┌────────────────┐  │  ┌─────────────────────┐  │
//! │  │ entries  │ │ url/name/path  │  │  │ entries + 3 indexes │  │
//! │  │          │ │ index tiers    │  │  │ (DocumentStore)     │  │
//! │  └──────────┘ └────────────────┘  │  └─────────────────────┘  │
//! │         │  put                    │            ▲              │
//! │         └──────▶ dirty set ──▶ Sync Scheduler ─┘              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lookup Order
//!
//! 1. Memory tier
//! 2. Entries queued for the disk tier
//! 3. Disk tier, copying hits back into memory
//!
//! Name lookups that miss both tiers fall back to a substring scan of the
//! memory tier.

mod disk;
mod entry;
mod manager;
mod memory;
mod metrics;
mod store;
mod sync;
pub mod key;
pub mod metadata;
pub mod origin;

pub use disk::{CleanupReport, DiskConfig, DiskTier, LoadReport};
pub use entry::{is_expired, CacheEntry, EntryMetadata, IndexEntry};
pub use key::IndexKind;
pub use manager::{CacheHit, CacheTier, Fetched, HybridCache};
pub use memory::MemoryTier;
pub use metrics::{CacheMetrics, DiskStats, IndexStats, MemoryStats, StatsSnapshot, SyncStats};
pub use origin::{FetchRequest, OriginFetcher, StaticOrigin};
pub use store::{DiskDocument, DocumentStore, InMemoryStore, JsonFileStore};
pub use sync::{ShutdownReport, SyncScheduler};
