//! Persistent result cache

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stoker_core::{CacheConfig, CacheError};
use tracing::{debug, info, warn};

use crate::job::Fingerprint;

const METADATA_FILE: &str = "metadata.json";
const PAYLOAD_FILE: &str = "payload.json";

/// A persistent store consulted before executing cacheable jobs.
///
/// Implementations must tolerate concurrent `load` and `store` calls from
/// several worker threads.
pub trait DiskCache: Send + Sync + fmt::Debug {
    /// Persisted bytes for `fingerprint`, or `None` on a miss
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError>;

    /// Persist bytes for `fingerprint`
    fn store(
        &self,
        fingerprint: &Fingerprint,
        type_name: &str,
        payload: &[u8],
    ) -> Result<(), CacheError>;
}

/// Sidecar written next to each payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntryMetadata {
    pub fingerprint: String,
    pub type_name: String,
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Directory-backed cache: one directory per fingerprint holding
/// `metadata.json` and the serialized payload
#[derive(Debug)]
pub struct FileDiskCache {
    cache_dir: PathBuf,
    max_size_bytes: u64,
    write_lock: Mutex<()>,
}

impl FileDiskCache {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_size_bytes,
            write_lock: Mutex::new(()),
        }
    }

    /// Cache rooted at `config.disk_dir`, resolved against `root`
    pub fn from_config(root: &Path, config: &CacheConfig) -> Self {
        Self::new(
            root.join(&config.disk_dir),
            config.disk_max_size_mb.saturating_mul(1024 * 1024),
        )
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir.join(fingerprint.to_string())
    }

    /// Metadata of every readable entry
    pub fn entries(&self) -> Result<Vec<(PathBuf, DiskEntryMetadata)>, CacheError> {
        let mut entries = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(entries);
        }

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            let staging = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'));
            if staging || !path.is_dir() {
                continue;
            }
            match read_metadata(&path) {
                Ok(metadata) => entries.push((path, metadata)),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable cache entry"),
            }
        }
        Ok(entries)
    }

    /// Delete the oldest entries until the cache fits its size limit
    fn trim(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries()?;
        let mut total: u64 = entries.iter().map(|(_, m)| m.size_bytes).sum();
        if total <= self.max_size_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|(_, metadata)| metadata.created_at);
        let mut removed = 0;
        for (path, metadata) in entries {
            if total <= self.max_size_bytes {
                break;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    total = total.saturating_sub(metadata.size_bytes);
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to trim cache entry"),
            }
        }

        debug!(removed, total, "disk cache trimmed");
        Ok(removed)
    }

    /// Remove entries older than `max_age`
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        info!(max_age_secs = max_age.as_secs(), "pruning disk cache");
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = PruneStats::default();

        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        for (path, metadata) in self.entries()? {
            stats.total += 1;
            if metadata.created_at < cutoff && fs::remove_dir_all(&path).is_ok() {
                stats.removed += 1;
            } else {
                stats.kept += 1;
            }
        }

        info!(
            total = stats.total,
            removed = stats.removed,
            kept = stats.kept,
            "disk cache prune complete"
        );
        Ok(stats)
    }

    /// Remove every entry
    pub fn clean(&self) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = self.entries()?;
        for (path, _) in &entries {
            fs::remove_dir_all(path)?;
        }
        info!(removed = entries.len(), "disk cache cleaned");
        Ok(entries.len())
    }

    pub fn status(&self) -> Result<DiskCacheStats, CacheError> {
        let entries = self.entries()?;
        Ok(DiskCacheStats {
            entries: entries.len(),
            total_size: entries.iter().map(|(_, m)| m.size_bytes).sum(),
            max_size: self.max_size_bytes,
        })
    }
}

fn read_metadata(entry_dir: &Path) -> Result<DiskEntryMetadata, CacheError> {
    let contents = fs::read_to_string(entry_dir.join(METADATA_FILE))?;
    Ok(serde_json::from_str(&contents)?)
}

impl DiskCache for FileDiskCache {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
        let entry_dir = self.entry_dir(fingerprint);
        let metadata = match read_metadata(&entry_dir) {
            Ok(metadata) => metadata,
            Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                debug!(fingerprint = %fingerprint, "disk cache miss");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if metadata.fingerprint != fingerprint.to_string() {
            return Err(CacheError::Corrupt(entry_dir));
        }

        match fs::read(entry_dir.join(PAYLOAD_FILE)) {
            Ok(bytes) => {
                debug!(fingerprint = %fingerprint, size = bytes.len(), "disk cache hit");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        type_name: &str,
        payload: &[u8],
    ) -> Result<(), CacheError> {
        let entry_dir = self.entry_dir(fingerprint);
        if entry_dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.cache_dir)?;

        // Staged in a sibling directory so readers never observe a partial entry
        let staging = tempfile::TempDir::new_in(&self.cache_dir)?;
        let metadata = DiskEntryMetadata {
            fingerprint: fingerprint.to_string(),
            type_name: type_name.to_string(),
            size_bytes: payload.len() as u64,
            created_at: chrono::Utc::now(),
        };
        fs::write(staging.path().join(PAYLOAD_FILE), payload)?;
        fs::write(
            staging.path().join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )?;

        // A renamed staging directory is gone by the time TempDir drops
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = fs::rename(staging.path(), &entry_dir) {
            if entry_dir.exists() {
                return Ok(());
            }
            return Err(e.into());
        }
        debug!(fingerprint = %fingerprint, size = payload.len(), "stored in disk cache");

        self.trim()?;
        Ok(())
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default, Serialize)]
pub struct PruneStats {
    pub total: usize,
    pub removed: usize,
    pub kept: usize,
}

/// Disk cache statistics
#[derive(Debug, Default, Serialize)]
pub struct DiskCacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
}

impl DiskCacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        format_bytes(self.total_size)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{} B", bytes)
    } else if value < KB * KB {
        format!("{:.1} KB", value / KB)
    } else if value < KB * KB * KB {
        format!("{:.1} MB", value / (KB * KB))
    } else {
        format!("{:.1} GB", value / (KB * KB * KB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use tempfile::TempDir;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::new(JobKind::Disk, name)
    }

    #[test]
    fn test_store_and_load() {
        let temp = TempDir::new().unwrap();
        let cache = FileDiskCache::new(temp.path().join("cache"), 1024 * 1024);

        cache.store(&fp("a"), "alloc::string::String", b"\"hello\"").unwrap();
        let loaded = cache.load(&fp("a")).unwrap();
        assert_eq!(loaded.as_deref(), Some(&b"\"hello\""[..]));
    }

    #[test]
    fn test_miss_on_empty_cache() {
        let temp = TempDir::new().unwrap();
        let cache = FileDiskCache::new(temp.path().join("cache"), 1024);
        assert!(cache.load(&fp("a")).unwrap().is_none());
    }

    #[test]
    fn test_store_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cache = FileDiskCache::new(temp.path().join("cache"), 1024);

        cache.store(&fp("a"), "u64", b"1").unwrap();
        cache.store(&fp("a"), "u64", b"2").unwrap();
        assert_eq!(cache.load(&fp("a")).unwrap().unwrap(), b"1");
        assert_eq!(cache.status().unwrap().entries, 1);
    }

    #[test]
    fn test_trim_removes_oldest() {
        let temp = TempDir::new().unwrap();
        let cache = FileDiskCache::new(temp.path().join("cache"), 10);

        cache.store(&fp("old"), "bytes", b"123456").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        cache.store(&fp("new"), "bytes", b"789012").unwrap();

        assert!(cache.load(&fp("old")).unwrap().is_none());
        assert!(cache.load(&fp("new")).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_metadata_detected() {
        let temp = TempDir::new().unwrap();
        let cache = FileDiskCache::new(temp.path().join("cache"), 1024);
        cache.store(&fp("a"), "u64", b"1").unwrap();

        let moved = temp.path().join("cache").join(fp("b").to_string());
        fs::rename(temp.path().join("cache").join(fp("a").to_string()), &moved).unwrap();

        assert!(matches!(cache.load(&fp("b")), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_prune_and_clean() {
        let temp = TempDir::new().unwrap();
        let cache = FileDiskCache::new(temp.path().join("cache"), 1024);
        cache.store(&fp("a"), "u64", b"1").unwrap();
        cache.store(&fp("b"), "u64", b"2").unwrap();

        let stats = cache.prune(Duration::from_secs(3600)).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.kept, 2);

        assert_eq!(cache.clean().unwrap(), 2);
        assert_eq!(cache.status().unwrap().entries, 0);
    }

    #[test]
    fn test_formatted_size() {
        let stats = DiskCacheStats {
            entries: 0,
            total_size: 1536,
            max_size: 0,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");
        assert_eq!(format_bytes(500), "500 B");
    }
}
