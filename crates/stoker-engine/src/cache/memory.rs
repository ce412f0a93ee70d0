//! In-memory result cache
//!
//! Entries are keyed by job fingerprint. Every live consumer of a result
//! holds a [`CacheRef`]; an entry with at least one reference is *in use*,
//! an entry with none is *pending eviction* and may be dropped by a sweep.
//! Sweeps evict the entry that was released longest ago first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, trace};

use crate::job::{Fingerprint, JobOutput};

#[derive(Debug)]
struct Slot {
    output: Option<JobOutput>,
    refs: usize,
    stale: bool,
    /// Clock value when the last reference was dropped
    released_at: u64,
}

impl Slot {
    fn size(&self) -> usize {
        self.output.as_ref().map_or(0, JobOutput::size_bytes)
    }
}

#[derive(Debug, Default)]
struct CacheTable {
    slots: HashMap<Fingerprint, Slot>,
    total_bytes: usize,
    clock: u64,
}

impl CacheTable {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = self.slots.remove(fingerprint)?;
        self.total_bytes -= slot.size();
        Some(slot)
    }
}

/// Description of one cached result, without its contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryInfo {
    pub fingerprint: Fingerprint,
    pub type_name: &'static str,
    pub size_bytes: usize,
    /// Set after `clear`; the entry is dropped once its last consumer releases it
    pub invalidated: bool,
}

/// Entries partitioned by whether any consumer still references them
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryCacheSnapshot {
    pub in_use: Vec<CacheEntryInfo>,
    pub pending_eviction: Vec<CacheEntryInfo>,
}

impl MemoryCacheSnapshot {
    pub fn total_bytes(&self) -> usize {
        self.in_use
            .iter()
            .chain(&self.pending_eviction)
            .map(|entry| entry.size_bytes)
            .sum()
    }
}

/// Fingerprint-keyed result cache with reference-counted entries
#[derive(Debug, Default)]
pub struct MemoryCache {
    table: Mutex<CacheTable>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference on `fingerprint`, creating an empty slot if the
    /// result does not exist yet. The reference is released on drop.
    pub fn acquire(self: &Arc<Self>, fingerprint: Fingerprint) -> CacheRef {
        let mut table = self.lock();
        let slot = table.slots.entry(fingerprint).or_insert(Slot {
            output: None,
            refs: 0,
            stale: false,
            released_at: 0,
        });
        slot.refs += 1;
        trace!(fingerprint = %fingerprint, refs = slot.refs, "cache reference acquired");
        CacheRef {
            cache: Arc::clone(self),
            fingerprint,
        }
    }

    fn release(&self, fingerprint: &Fingerprint) {
        let mut table = self.lock();
        let released_at = table.tick();
        let Some(slot) = table.slots.get_mut(fingerprint) else {
            return;
        };

        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return;
        }

        if slot.output.is_none() || slot.stale {
            table.remove(fingerprint);
            trace!(fingerprint = %fingerprint, "cache slot dropped on release");
        } else {
            slot.released_at = released_at;
        }
    }

    /// Store a result, replacing any previous (possibly invalidated) value
    pub fn insert(&self, fingerprint: Fingerprint, output: JobOutput) {
        let mut table = self.lock();
        let released_at = table.tick();
        let size = output.size_bytes();
        let slot = table.slots.entry(fingerprint).or_insert(Slot {
            output: None,
            refs: 0,
            stale: false,
            released_at,
        });
        let previous = slot.size();
        slot.output = Some(output);
        slot.stale = false;
        table.total_bytes = table.total_bytes - previous + size;
        debug!(fingerprint = %fingerprint, size, total = table.total_bytes, "result cached");
    }

    /// A result that has not been invalidated
    pub fn get_fresh(&self, fingerprint: &Fingerprint) -> Option<JobOutput> {
        let table = self.lock();
        table
            .slots
            .get(fingerprint)
            .filter(|slot| !slot.stale)
            .and_then(|slot| slot.output.clone())
    }

    /// Any stored result, including invalidated ones still held by consumers
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<JobOutput> {
        self.lock()
            .slots
            .get(fingerprint)
            .and_then(|slot| slot.output.clone())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock()
            .slots
            .get(fingerprint)
            .is_some_and(|slot| slot.output.is_some())
    }

    pub fn snapshot(&self) -> MemoryCacheSnapshot {
        let table = self.lock();
        let mut snapshot = MemoryCacheSnapshot::default();
        for (fingerprint, slot) in &table.slots {
            let Some(output) = &slot.output else {
                continue;
            };
            let info = CacheEntryInfo {
                fingerprint: *fingerprint,
                type_name: output.type_name(),
                size_bytes: output.size_bytes(),
                invalidated: slot.stale,
            };
            if slot.refs > 0 {
                snapshot.in_use.push(info);
            } else {
                snapshot.pending_eviction.push(info);
            }
        }
        snapshot
    }

    /// Drop every unreferenced entry and invalidate the rest.
    ///
    /// Invalidated entries stay readable to their current consumers and are
    /// removed when the last of them releases; new lookups miss.
    pub fn clear(&self) -> usize {
        let mut table = self.lock();
        let unreferenced: Vec<Fingerprint> = table
            .slots
            .iter()
            .filter(|(_, slot)| slot.refs == 0)
            .map(|(fingerprint, _)| *fingerprint)
            .collect();
        for fingerprint in &unreferenced {
            table.remove(fingerprint);
        }

        let mut invalidated = 0;
        for slot in table.slots.values_mut() {
            if slot.output.is_some() {
                slot.stale = true;
                invalidated += 1;
            }
        }

        debug!(
            dropped = unreferenced.len(),
            invalidated, "memory cache cleared"
        );
        unreferenced.len()
    }

    /// Evict unreferenced entries, least recently released first, until the
    /// total size is at most `target_bytes`. Returns the number evicted.
    pub fn reduce_to(&self, target_bytes: usize) -> usize {
        let mut table = self.lock();
        if table.total_bytes <= target_bytes {
            return 0;
        }

        let mut candidates: Vec<(u64, Fingerprint)> = table
            .slots
            .iter()
            .filter(|(_, slot)| slot.refs == 0 && slot.output.is_some())
            .map(|(fingerprint, slot)| (slot.released_at, *fingerprint))
            .collect();
        candidates.sort();

        let mut evicted = 0;
        for (_, fingerprint) in candidates {
            if table.total_bytes <= target_bytes {
                break;
            }
            if table.remove(&fingerprint).is_some() {
                evicted += 1;
            }
        }

        debug!(
            evicted,
            total = table.total_bytes,
            target = target_bytes,
            "memory cache reduced"
        );
        evicted
    }

    /// Estimated size of every stored result
    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| slot.output.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live reference to a memory cache entry; released on drop
pub struct CacheRef {
    cache: Arc<MemoryCache>,
    fingerprint: Fingerprint,
}

impl CacheRef {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The referenced result, if it has been produced
    pub fn output(&self) -> Option<JobOutput> {
        self.cache.peek(&self.fingerprint)
    }
}

impl Clone for CacheRef {
    fn clone(&self) -> Self {
        self.cache.acquire(self.fingerprint)
    }
}

impl std::fmt::Debug for CacheRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CacheRef").field(&self.fingerprint).finish()
    }
}

impl Drop for CacheRef {
    fn drop(&mut self) {
        self.cache.release(&self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    const MIB: usize = 1024 * 1024;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::new(JobKind::Cpu, name)
    }

    fn megabyte() -> JobOutput {
        JobOutput::new(vec![0u8; MIB])
    }

    #[test]
    fn test_reference_partitions_snapshot() {
        let cache = Arc::new(MemoryCache::new());
        let held = cache.acquire(fp("a"));
        cache.insert(fp("a"), megabyte());
        cache.insert(fp("b"), megabyte());

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.in_use.len(), 1);
        assert_eq!(snapshot.in_use[0].fingerprint, fp("a"));
        assert_eq!(snapshot.pending_eviction.len(), 1);
        assert_eq!(snapshot.total_bytes(), 2 * MIB);

        drop(held);
        assert_eq!(cache.snapshot().pending_eviction.len(), 2);
    }

    #[test]
    fn test_reacquire_promotes_to_in_use() {
        let cache = Arc::new(MemoryCache::new());
        cache.insert(fp("a"), megabyte());
        assert_eq!(cache.snapshot().pending_eviction.len(), 1);

        let _held = cache.acquire(fp("a"));
        assert_eq!(cache.snapshot().in_use.len(), 1);
    }

    #[test]
    fn test_release_without_result_drops_slot() {
        let cache = Arc::new(MemoryCache::new());
        let held = cache.acquire(fp("a"));
        drop(held);
        assert!(cache.is_empty());
        assert!(cache.lock().slots.is_empty());
    }

    #[test]
    fn test_reduce_keeps_in_use_entries() {
        let cache = Arc::new(MemoryCache::new());
        let mut held = Vec::new();
        for i in 0..10 {
            let key = fp(&format!("entry-{}", i));
            if i < 4 {
                held.push(cache.acquire(key));
            }
            cache.insert(key, megabyte());
        }

        let evicted = cache.reduce_to(5 * MIB);
        assert_eq!(evicted, 5);
        assert!(cache.total_bytes() <= 5 * MIB);
        assert_eq!(cache.snapshot().in_use.len(), 4);

        // repeated sweeps never grow the cache or touch in-use entries
        assert_eq!(cache.reduce_to(5 * MIB), 0);
        assert_eq!(cache.reduce_to(0), 1);
        assert_eq!(cache.total_bytes(), 4 * MIB);
        assert_eq!(cache.snapshot().in_use.len(), 4);
    }

    #[test]
    fn test_reduce_evicts_least_recently_released_first() {
        let cache = Arc::new(MemoryCache::new());
        let a = cache.acquire(fp("a"));
        let b = cache.acquire(fp("b"));
        cache.insert(fp("a"), megabyte());
        cache.insert(fp("b"), megabyte());

        drop(b);
        drop(a);

        cache.reduce_to(MIB);
        assert!(cache.contains(&fp("a")));
        assert!(!cache.contains(&fp("b")));
    }

    #[test]
    fn test_clear_invalidates_in_use_entries() {
        let cache = Arc::new(MemoryCache::new());
        let held = cache.acquire(fp("a"));
        cache.insert(fp("a"), megabyte());
        cache.insert(fp("b"), megabyte());

        assert_eq!(cache.clear(), 1);
        assert!(cache.get_fresh(&fp("a")).is_none());
        assert!(held.output().is_some());
        assert!(cache.snapshot().in_use[0].invalidated);

        drop(held);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_insert_refreshes_invalidated_entry() {
        let cache = Arc::new(MemoryCache::new());
        let _held = cache.acquire(fp("a"));
        cache.insert(fp("a"), megabyte());
        cache.clear();

        cache.insert(fp("a"), JobOutput::new(String::from("fresh")));
        assert!(cache.get_fresh(&fp("a")).is_some());
        assert_eq!(cache.total_bytes(), 5);
    }
}
