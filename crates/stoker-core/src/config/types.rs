//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for Stoker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool configuration
    pub engine: EngineConfig,

    /// Memory and disk cache configuration
    pub cache: CacheConfig,

    /// Remote service configuration
    pub remote: RemoteConfig,
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of CPU worker threads (defaults to available parallelism)
    pub cpu_threads: Option<usize>,

    /// Number of disk worker threads
    pub disk_threads: usize,

    /// Upper bound on threads in each of the web pools
    pub web_max_threads: usize,

    /// Seconds an idle web thread lingers before exiting
    pub web_idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_threads: None,
            disk_threads: 2,
            web_max_threads: 64,
            web_idle_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Effective CPU pool size
    pub fn effective_cpu_threads(&self) -> usize {
        self.cpu_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Soft cap on the in-memory result cache; unreferenced entries are
    /// swept whenever an insert pushes the cache above it
    pub memory_limit_mb: Option<u64>,

    /// Directory of the persistent cache, relative to the working directory
    pub disk_dir: PathBuf,

    /// Maximum size of the persistent cache
    pub disk_max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: None,
            disk_dir: PathBuf::from(".stoker").join("cache"),
            disk_max_size_mb: 1024,
        }
    }
}

/// Remote calculation service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Default API URL used for authentication
    pub api_url: Option<String>,
}
