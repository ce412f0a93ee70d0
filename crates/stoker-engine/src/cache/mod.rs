//! Result caches
//!
//! - [`MemoryCache`]: fingerprint-keyed results with reference counting and
//!   LRU eviction of unreferenced entries
//! - [`DiskCache`]: swappable persistent store probed before execution
//! - [`MutableDataCache`]: externally mutable entities with generation counters

mod disk;
mod memory;
mod mutable;

pub use disk::{DiskCache, DiskCacheStats, DiskEntryMetadata, FileDiskCache, PruneStats};
pub use memory::{CacheEntryInfo, CacheRef, MemoryCache, MemoryCacheSnapshot};
pub use mutable::{MutableDataCache, MutableUpdate, MutableUpdateSender};
