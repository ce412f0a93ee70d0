//! Job table and dependency tracking
//!
//! Every submitted job that has not finished lives here, keyed by
//! fingerprint. A record tracks which dependencies are still unmet and which
//! jobs wait on it; edges are fingerprints into this table, never owning
//! references. Succeeded and failed jobs leave the table; canceled jobs stay
//! until purged so their state remains visible in status snapshots.
//!
//! The table sits behind the engine's jobs lock. It may take the memory
//! cache lock but the cache never calls back into it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{CacheRef, MemoryCache};
use crate::job::{DiskCodec, Fingerprint, JobDefinition, JobFn, JobKind, JobOutput, JobState};
use crate::status::JobInfo;

struct JobRecord {
    kind: JobKind,
    label: String,
    state: JobState,
    run: Option<(JobFn, Option<Arc<DiskCodec>>)>,
    dependencies: Vec<Fingerprint>,
    unmet: HashSet<Fingerprint>,
    dependents: Vec<Fingerprint>,
    /// Keeps dependency results resident until this job has run
    dependency_refs: Vec<CacheRef>,
    cancel: CancellationToken,
    state_tx: watch::Sender<JobState>,
    submitted_at: DateTime<Utc>,
}

impl JobRecord {
    fn is_pending(&self) -> bool {
        matches!(
            self.state,
            JobState::WaitingOnDependencies | JobState::Ready
        )
    }

    fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

/// A newly admitted job
pub(crate) struct Admitted {
    pub state: JobState,
    pub receiver: watch::Receiver<JobState>,
}

/// A job refused at submission because a dependency can never produce a result
#[derive(Debug)]
pub(crate) struct Rejected {
    pub dependency: Fingerprint,
}

/// A job a worker has claimed
pub(crate) struct Claim {
    pub kind: JobKind,
    pub label: String,
    pub run: JobFn,
    pub codec: Option<Arc<DiskCodec>>,
    pub dependencies: Vec<(Fingerprint, JobOutput)>,
    pub cancel: CancellationToken,
}

pub(crate) enum ClaimOutcome {
    Claimed(Claim),
    /// Canceled, already running or no longer tracked
    Skipped,
    /// A dependency's result disappeared before the job could start
    MissingDependency {
        kind: JobKind,
        label: String,
        dependency: Fingerprint,
    },
}

/// A job failed because one of its dependencies did not succeed.
///
/// The job has left the table but its observers still see the old state
/// until [`Cascaded::notify`] is called, so the failure can be recorded first.
#[derive(Debug)]
pub(crate) struct Cascaded {
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub label: String,
    pub dependency: Fingerprint,
    pub state: JobState,
    state_tx: watch::Sender<JobState>,
}

impl Cascaded {
    /// Publish the failed state to the job's handles
    pub fn notify(&self) {
        self.state_tx.send_replace(self.state);
    }
}

#[derive(Default)]
pub(crate) struct DependencyResolver {
    jobs: HashMap<Fingerprint, JobRecord>,
}

impl DependencyResolver {
    /// State channel of a job that has not reached a terminal state
    pub fn subscribe(&self, fingerprint: &Fingerprint) -> Option<watch::Receiver<JobState>> {
        self.jobs
            .get(fingerprint)
            .filter(|record| !record.state.is_terminal())
            .map(|record| record.state_tx.subscribe())
    }

    /// Add a job to the table.
    ///
    /// A dependency that is still pending or executing becomes an unmet
    /// edge; one whose result is cached is satisfied immediately. Anything
    /// else (unknown, canceled, failed) rejects the job.
    pub fn admit(
        &mut self,
        definition: JobDefinition,
        cache: &Arc<MemoryCache>,
    ) -> Result<Admitted, Rejected> {
        let fingerprint = definition.fingerprint();
        let mut unmet = HashSet::new();
        let mut dependency_refs = Vec::with_capacity(definition.dependencies().len());

        for dependency in definition.dependencies() {
            let live = self
                .jobs
                .get(dependency)
                .is_some_and(|record| !record.state.is_terminal());
            if live {
                unmet.insert(*dependency);
            } else if !cache.contains(dependency) {
                debug!(
                    fingerprint = %fingerprint.short(),
                    dependency = %dependency.short(),
                    "dependency has no result and is not pending"
                );
                return Err(Rejected {
                    dependency: *dependency,
                });
            }
            dependency_refs.push(cache.acquire(*dependency));
        }

        for dependency in &unmet {
            if let Some(record) = self.jobs.get_mut(dependency) {
                record.dependents.push(fingerprint);
            }
        }

        let state = if unmet.is_empty() {
            JobState::Ready
        } else {
            JobState::WaitingOnDependencies
        };
        let (state_tx, receiver) = watch::channel(state);
        let kind = definition.kind();
        let label = definition.label().to_string();
        let dependencies = definition.dependencies().to_vec();
        let run = definition.into_parts();

        trace!(fingerprint = %fingerprint.short(), ?state, unmet = unmet.len(), "job admitted");
        self.jobs.insert(
            fingerprint,
            JobRecord {
                kind,
                label,
                state,
                run: Some(run),
                dependencies,
                unmet,
                dependents: Vec::new(),
                dependency_refs,
                cancel: CancellationToken::new(),
                state_tx,
                submitted_at: Utc::now(),
            },
        );

        Ok(Admitted { state, receiver })
    }

    /// Move a ready job to executing and hand its closure to the worker
    pub fn claim(&mut self, fingerprint: &Fingerprint, cache: &MemoryCache) -> ClaimOutcome {
        let Some(record) = self.jobs.get_mut(fingerprint) else {
            return ClaimOutcome::Skipped;
        };
        if record.state != JobState::Ready {
            return ClaimOutcome::Skipped;
        }
        let Some((run, codec)) = record.run.take() else {
            return ClaimOutcome::Skipped;
        };

        let mut dependencies = Vec::with_capacity(record.dependencies.len());
        let mut missing = None;
        for dependency in &record.dependencies {
            match cache.peek(dependency) {
                Some(output) => dependencies.push((*dependency, output)),
                None => {
                    missing = Some(*dependency);
                    break;
                }
            }
        }

        record.set_state(JobState::Executing);
        if let Some(dependency) = missing {
            return ClaimOutcome::MissingDependency {
                kind: record.kind,
                label: record.label.clone(),
                dependency,
            };
        }
        ClaimOutcome::Claimed(Claim {
            kind: record.kind,
            label: record.label.clone(),
            run,
            codec,
            dependencies,
            cancel: record.cancel.clone(),
        })
    }

    /// Record success and return the dependents that became ready
    pub fn complete(&mut self, fingerprint: &Fingerprint) -> Vec<(Fingerprint, JobKind)> {
        let Some(mut record) = self.jobs.remove(fingerprint) else {
            return Vec::new();
        };
        record.set_state(JobState::Succeeded);

        let mut released = Vec::new();
        for dependent in &record.dependents {
            let Some(waiting) = self.jobs.get_mut(dependent) else {
                continue;
            };
            if waiting.state != JobState::WaitingOnDependencies {
                continue;
            }
            waiting.unmet.remove(fingerprint);
            if waiting.unmet.is_empty() {
                waiting.set_state(JobState::Ready);
                released.push((*dependent, waiting.kind));
            }
        }

        trace!(fingerprint = %fingerprint.short(), released = released.len(), "job completed");
        released
    }

    /// Record a failure of `fingerprint` and fail everything downstream of it
    pub fn fail(&mut self, fingerprint: &Fingerprint, transient: bool) -> Vec<Cascaded> {
        let Some(mut record) = self.jobs.remove(fingerprint) else {
            return Vec::new();
        };
        let state = if transient {
            JobState::FailedTransient
        } else {
            JobState::FailedPermanent
        };
        record.set_state(state);
        self.cascade(*fingerprint, record.dependents, state)
    }

    /// An executing job observed its cancellation
    pub fn finish_canceled(&mut self, fingerprint: &Fingerprint) -> Vec<Cascaded> {
        let Some(record) = self.jobs.get_mut(fingerprint) else {
            return Vec::new();
        };
        record.set_state(JobState::Canceled);
        record.dependency_refs.clear();
        let dependents = std::mem::take(&mut record.dependents);
        self.cascade(*fingerprint, dependents, JobState::FailedPermanent)
    }

    fn cascade(
        &mut self,
        origin: Fingerprint,
        dependents: Vec<Fingerprint>,
        state: JobState,
    ) -> Vec<Cascaded> {
        let mut cascaded = Vec::new();
        let mut stack: Vec<(Fingerprint, Fingerprint)> =
            dependents.into_iter().map(|d| (d, origin)).collect();

        while let Some((fingerprint, dependency)) = stack.pop() {
            let pending = self
                .jobs
                .get(&fingerprint)
                .is_some_and(|record| record.is_pending());
            if !pending {
                continue;
            }
            let Some(record) = self.jobs.remove(&fingerprint) else {
                continue;
            };
            record.cancel.cancel();
            stack.extend(record.dependents.iter().map(|d| (*d, fingerprint)));
            cascaded.push(Cascaded {
                fingerprint,
                kind: record.kind,
                label: record.label,
                dependency,
                state,
                state_tx: record.state_tx,
            });
        }

        if !cascaded.is_empty() {
            debug!(
                origin = %origin.short(),
                count = cascaded.len(),
                "dependency failure propagated"
            );
        }
        cascaded
    }

    /// Cancel one job. A pending job is canceled at once and its dependents
    /// fail; an executing job is asked to stop. Returns whether the job was
    /// still running or pending.
    pub fn cancel(&mut self, fingerprint: &Fingerprint) -> (bool, Vec<Cascaded>) {
        let Some(record) = self.jobs.get_mut(fingerprint) else {
            return (false, Vec::new());
        };
        match record.state {
            JobState::Executing => {
                record.cancel.cancel();
                (true, Vec::new())
            }
            JobState::WaitingOnDependencies | JobState::Ready => {
                record.cancel.cancel();
                record.run = None;
                record.dependency_refs.clear();
                record.set_state(JobState::Canceled);
                let dependents = std::mem::take(&mut record.dependents);
                (
                    true,
                    self.cascade(*fingerprint, dependents, JobState::FailedPermanent),
                )
            }
            _ => (false, Vec::new()),
        }
    }

    /// Cancel every job that has not started; returns them
    pub fn cancel_pending(&mut self) -> Vec<(Fingerprint, String)> {
        let mut canceled = Vec::new();
        for (fingerprint, record) in self.jobs.iter_mut() {
            if !record.is_pending() {
                continue;
            }
            record.cancel.cancel();
            record.run = None;
            record.dependency_refs.clear();
            record.dependents.clear();
            record.set_state(JobState::Canceled);
            canceled.push((*fingerprint, record.label.clone()));
        }
        canceled
    }

    /// Signal every executing job to stop; returns how many were signaled
    pub fn interrupt_executing(&mut self) -> usize {
        let mut interrupted = 0;
        for record in self.jobs.values() {
            if record.state == JobState::Executing {
                record.cancel.cancel();
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Drop bookkeeping of canceled jobs
    pub fn purge_canceled(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, record| record.state != JobState::Canceled);
        before - self.jobs.len()
    }

    pub fn executing(&self) -> usize {
        self.jobs
            .values()
            .filter(|record| record.state == JobState::Executing)
            .count()
    }

    pub fn info(&self) -> HashMap<Fingerprint, JobInfo> {
        self.jobs
            .iter()
            .map(|(fingerprint, record)| {
                (
                    *fingerprint,
                    JobInfo {
                        label: record.label.clone(),
                        kind: record.kind,
                        state: record.state,
                        submitted_at: record.submitted_at,
                    },
                )
            })
            .collect()
    }
}
