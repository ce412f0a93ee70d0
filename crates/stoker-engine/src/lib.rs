//! Stoker Engine - background execution engine
//!
//! This crate runs heterogeneous units of work (CPU calculations, remote
//! queries and disk jobs) on dedicated worker pools, resolves dependencies
//! between jobs, deduplicates and caches results in memory and on disk,
//! and tracks the authentication and realm-context state that remote jobs
//! run against.

pub mod auth;
pub mod cache;
pub mod context;
pub mod engine;
pub mod graph;
pub mod handle;
pub mod job;
pub mod pool;
pub mod remote;
pub mod reporter;
mod resolver;
pub mod status;

pub use auth::AuthenticationStatus;
pub use cache::{
    CacheEntryInfo, CacheRef, DiskCache, DiskCacheStats, DiskEntryMetadata, FileDiskCache,
    MemoryCache, MemoryCacheSnapshot, MutableDataCache, MutableUpdate, MutableUpdateSender,
    PruneStats,
};
pub use context::{
    ContextRequestParameters, ContextRequestStatus, FrameworkContext, FrameworkUsageInfo,
};
pub use engine::{Engine, EngineBuilder};
pub use graph::{GraphError, GraphNode, JobGraph, JobSpec};
pub use handle::JobHandle;
pub use job::{
    Fingerprint, JobContext, JobDefinition, JobError, JobKind, JobOutput, JobState, Payload,
};
pub use pool::{PoolPolicy, PoolStatus, WorkerPool};
pub use remote::{
    AuthFailure, ContextFailure, Credentials, OfflineRemoteService, RemoteService, Session,
};
pub use reporter::{
    CollectingReporter, JobEvent, JobReporter, JobReporterRegistry, ResultSource, TracingReporter,
};
pub use status::{EngineStatus, JobFailure, JobInfo, QueueStatus};
