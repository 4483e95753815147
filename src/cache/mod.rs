//! Client-side query cache.
//!
//! This module provides the keyed result store every other component reads
//! and writes through:
//! - Structural keys whose prefixes act as invalidation scopes
//! - Staleness tracking with background refetch for subscribed entries
//! - Deduplicated, cancellable loads
//! - Optional snapshot persistence for warm starts

mod entry;
mod key;
mod query_cache;
mod storage;

pub use entry::{CacheEntry, EntryStatus};
pub use key::{CacheKey, KeyPart};
pub use query_cache::{LoadFuture, QueryCache, QueryCacheBuilder, Refetcher, StalePolicy, Subscription};
pub use storage::{NoopStore, Snapshot, SnapshotStore, SqliteStore, StoreError};
