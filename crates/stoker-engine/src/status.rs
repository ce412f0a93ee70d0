//! Status snapshots and failure lists

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{Fingerprint, JobKind, JobState};
use crate::pool::PoolStatus;

/// Counters for one job queue and its pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued_jobs: usize,
    pub total_threads: usize,
    pub idle_threads: usize,
}

impl QueueStatus {
    pub fn active_threads(&self) -> usize {
        self.total_threads.saturating_sub(self.idle_threads)
    }

    /// Queued plus executing jobs
    pub fn total_jobs(&self) -> usize {
        self.queued_jobs + self.active_threads()
    }
}

impl From<PoolStatus> for QueueStatus {
    fn from(status: PoolStatus) -> Self {
        Self {
            queued_jobs: status.queued,
            total_threads: status.total_threads,
            idle_threads: status.idle_threads,
        }
    }
}

/// A recorded job failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub label: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Diagnostic record for a job the engine still tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub label: String,
    pub kind: JobKind,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
}

/// Point-in-time view of the engine, refreshed by `Engine::update_status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub queues: BTreeMap<JobKind, QueueStatus>,
    /// Transient failures recorded since the previous refresh
    pub transient_failures: Vec<JobFailure>,
    pub jobs: HashMap<Fingerprint, JobInfo>,
}

impl EngineStatus {
    pub fn queue(&self, kind: JobKind) -> QueueStatus {
        self.queues.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_jobs(&self) -> usize {
        self.queues.values().map(QueueStatus::total_jobs).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.total_jobs() == 0
            && self
                .jobs
                .values()
                .all(|info| info.state.is_terminal())
    }
}

/// Transient and permanent failure lists, each drained by its reader
#[derive(Debug, Default)]
pub(crate) struct FailureLog {
    transient: Mutex<Vec<JobFailure>>,
    permanent: Mutex<Vec<JobFailure>>,
}

fn lock(list: &Mutex<Vec<JobFailure>>) -> MutexGuard<'_, Vec<JobFailure>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FailureLog {
    pub fn record(&self, transient: bool, failure: JobFailure) {
        if transient {
            lock(&self.transient).push(failure);
        } else {
            lock(&self.permanent).push(failure);
        }
    }

    pub fn drain_transient(&self) -> Vec<JobFailure> {
        std::mem::take(&mut *lock(&self.transient))
    }

    pub fn drain_permanent(&self) -> Vec<JobFailure> {
        std::mem::take(&mut *lock(&self.permanent))
    }
}
