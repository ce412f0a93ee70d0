//! Submitter-side view of a job

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::cache::CacheRef;
use crate::job::{Fingerprint, JobOutput, JobState};

/// Handle returned by `Engine::submit`.
///
/// The handle keeps the job's memory-cache entry in use; dropping it lets
/// the entry become eligible for eviction.
pub struct JobHandle {
    fingerprint: Fingerprint,
    state: watch::Receiver<JobState>,
    cache_ref: CacheRef,
}

impl JobHandle {
    pub(crate) fn new(state: watch::Receiver<JobState>, cache_ref: CacheRef) -> Self {
        Self {
            fingerprint: cache_ref.fingerprint(),
            state,
            cache_ref,
        }
    }

    /// Handle for a job whose outcome is already known
    pub(crate) fn resolved(state: JobState, cache_ref: CacheRef) -> Self {
        let (_, receiver) = watch::channel(state);
        Self::new(receiver, cache_ref)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Current state, without waiting
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut receiver = self.state.clone();
        if let Ok(state) = receiver.wait_for(JobState::is_terminal).await {
            return *state;
        }

        // The engine dropped the job without a final state (shutdown)
        let last = *receiver.borrow();
        if last.is_terminal() {
            last
        } else {
            JobState::Canceled
        }
    }

    /// Type-erased result, once the job has succeeded
    pub fn output(&self) -> Option<JobOutput> {
        self.cache_ref.output()
    }

    /// Typed result, once the job has succeeded
    pub fn result<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.output().and_then(|output| output.downcast::<T>())
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> Self {
        Self {
            fingerprint: self.fingerprint,
            state: self.state.clone(),
            cache_ref: self.cache_ref.clone(),
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::job::JobKind;

    #[tokio::test]
    async fn test_resolved_handle_reads_cache() {
        let cache = Arc::new(MemoryCache::new());
        let fp = Fingerprint::new(JobKind::Cpu, "dose");
        cache.insert(fp, JobOutput::new(42u64));

        let handle = JobHandle::resolved(JobState::Succeeded, cache.acquire(fp));
        assert_eq!(handle.wait().await, JobState::Succeeded);
        assert_eq!(*handle.result::<u64>().unwrap(), 42);
        assert!(handle.result::<String>().is_none());
        assert_eq!(cache.snapshot().in_use.len(), 1);

        drop(handle);
        assert_eq!(cache.snapshot().pending_eviction.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_observes_transition() {
        let cache = Arc::new(MemoryCache::new());
        let fp = Fingerprint::new(JobKind::Cpu, "dose");
        let (tx, rx) = watch::channel(JobState::Ready);
        let handle = JobHandle::new(rx, cache.acquire(fp));

        std::thread::spawn(move || {
            tx.send_replace(JobState::Executing);
            tx.send_replace(JobState::FailedTransient);
        });

        assert_eq!(handle.wait().await, JobState::FailedTransient);
    }

    #[tokio::test]
    async fn test_dropped_sender_reads_as_canceled() {
        let cache = Arc::new(MemoryCache::new());
        let fp = Fingerprint::new(JobKind::Cpu, "dose");
        let (tx, rx) = watch::channel(JobState::Ready);
        let handle = JobHandle::new(rx, cache.acquire(fp));
        drop(tx);

        assert_eq!(handle.wait().await, JobState::Canceled);
    }
}
