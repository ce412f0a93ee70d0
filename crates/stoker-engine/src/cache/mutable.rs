//! Cache for externally mutable entities
//!
//! Values here are not pure functions of job inputs, so they are keyed by
//! entity id and invalidated by push notifications. Each applied change bumps
//! a global generation counter and stamps the entity with it; a consumer
//! holding an older generation must treat its copy as stale.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A change notification for one entity
pub enum MutableUpdate {
    /// The entity has a new authoritative value
    Changed {
        id: String,
        value: Arc<dyn Any + Send + Sync>,
    },
    /// The entity no longer exists
    Removed { id: String },
}

impl MutableUpdate {
    pub fn id(&self) -> &str {
        match self {
            Self::Changed { id, .. } | Self::Removed { id } => id,
        }
    }
}

impl std::fmt::Debug for MutableUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Changed { id, .. } => f.debug_struct("Changed").field("id", id).finish(),
            Self::Removed { id } => f.debug_struct("Removed").field("id", id).finish(),
        }
    }
}

/// Cloneable producer side of the update queue; usable from any thread
#[derive(Debug, Clone)]
pub struct MutableUpdateSender {
    tx: mpsc::UnboundedSender<MutableUpdate>,
}

impl MutableUpdateSender {
    /// Queue a new value for `id`. Returns false once the cache is gone.
    pub fn changed<T: Any + Send + Sync>(&self, id: impl Into<String>, value: T) -> bool {
        self.tx
            .send(MutableUpdate::Changed {
                id: id.into(),
                value: Arc::new(value),
            })
            .is_ok()
    }

    /// Queue removal of `id`
    pub fn removed(&self, id: impl Into<String>) -> bool {
        self.tx.send(MutableUpdate::Removed { id: id.into() }).is_ok()
    }
}

struct MutableEntry {
    value: Arc<dyn Any + Send + Sync>,
    generation: u64,
}

#[derive(Default)]
struct MutableTable {
    entries: HashMap<String, MutableEntry>,
    generation: u64,
}

/// Entity-id keyed cache with push invalidation
pub struct MutableDataCache {
    table: Mutex<MutableTable>,
    tx: mpsc::UnboundedSender<MutableUpdate>,
    rx: Mutex<mpsc::UnboundedReceiver<MutableUpdate>>,
}

impl Default for MutableDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MutableDataCache {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            table: Mutex::new(MutableTable::default()),
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MutableTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for queueing external change notifications
    pub fn sender(&self) -> MutableUpdateSender {
        MutableUpdateSender {
            tx: self.tx.clone(),
        }
    }

    /// Store an observed value directly; returns its generation
    pub fn insert<T: Any + Send + Sync>(&self, id: impl Into<String>, value: T) -> u64 {
        let mut table = self.lock();
        table.generation += 1;
        let generation = table.generation;
        table.entries.insert(
            id.into(),
            MutableEntry {
                value: Arc::new(value),
                generation,
            },
        );
        generation
    }

    /// Current value of `id` and the generation it was stamped with
    pub fn get<T: Any + Send + Sync>(&self, id: &str) -> Option<(Arc<T>, u64)> {
        let table = self.lock();
        let entry = table.entries.get(id)?;
        let value = Arc::clone(&entry.value).downcast::<T>().ok()?;
        Some((value, entry.generation))
    }

    /// Whether a copy stamped with `generation` is still current
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.lock()
            .entries
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Latest generation handed out
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply every queued notification; returns how many were applied
    pub fn process_updates(&self) -> usize {
        let mut pending = Vec::new();
        {
            let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
            while let Ok(update) = rx.try_recv() {
                pending.push(update);
            }
        }
        if pending.is_empty() {
            return 0;
        }

        let mut table = self.lock();
        for update in &pending {
            table.generation += 1;
            let generation = table.generation;
            match update {
                MutableUpdate::Changed { id, value } => {
                    trace!(id = %id, generation, "mutable entity changed");
                    table.entries.insert(
                        id.clone(),
                        MutableEntry {
                            value: Arc::clone(value),
                            generation,
                        },
                    );
                }
                MutableUpdate::Removed { id } => {
                    trace!(id = %id, generation, "mutable entity removed");
                    table.entries.remove(id);
                }
            }
        }
        debug!(
            applied = pending.len(),
            generation = table.generation,
            "mutable cache updates processed"
        );
        pending.len()
    }

    /// Drop every entity; the generation still advances so that every
    /// outstanding copy reads as stale
    pub fn clear(&self) -> usize {
        let mut table = self.lock();
        let dropped = table.entries.len();
        table.entries.clear();
        table.generation += 1;
        debug!(dropped, "mutable data cache cleared");
        dropped
    }
}

impl std::fmt::Debug for MutableDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("MutableDataCache")
            .field("entries", &table.entries.len())
            .field("generation", &table.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = MutableDataCache::new();
        let generation = cache.insert("patient-1", String::from("Ada"));

        let (value, seen) = cache.get::<String>("patient-1").unwrap();
        assert_eq!(value.as_str(), "Ada");
        assert_eq!(seen, generation);
        assert!(cache.get::<u64>("patient-1").is_none());
    }

    #[test]
    fn test_updates_apply_only_when_processed() {
        let cache = MutableDataCache::new();
        let generation = cache.insert("plan", 1u64);
        let sender = cache.sender();

        assert!(sender.changed("plan", 2u64));
        assert_eq!(*cache.get::<u64>("plan").unwrap().0, 1);

        assert_eq!(cache.process_updates(), 1);
        let (value, seen) = cache.get::<u64>("plan").unwrap();
        assert_eq!(*value, 2);
        assert!(seen > generation);
        assert!(!cache.is_current("plan", generation));
        assert!(cache.is_current("plan", seen));
    }

    #[test]
    fn test_removal_and_empty_processing() {
        let cache = MutableDataCache::new();
        cache.insert("plan", 1u64);
        cache.sender().removed("plan");

        assert_eq!(cache.process_updates(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.process_updates(), 0);
    }

    #[test]
    fn test_sender_usable_from_other_threads() {
        let cache = MutableDataCache::new();
        let sender = cache.sender();
        std::thread::spawn(move || {
            for i in 0..10u64 {
                sender.changed(format!("entity-{}", i), i);
            }
        })
        .join()
        .unwrap();

        assert_eq!(cache.process_updates(), 10);
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let cache = MutableDataCache::new();
        let generation = cache.insert("plan", 1u64);
        let before = cache.generation();

        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
        assert!(!cache.is_current("plan", generation));
        assert!(cache.generation() > before);
    }
}
