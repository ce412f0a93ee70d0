//! The background execution engine
//!
//! An [`Engine`] owns one worker pool per [`JobKind`], the job table, the
//! memory cache, the optional disk cache, and the authentication and context
//! state that web jobs run against. Every operation takes `&self`; state is
//! split across small locks so the pools never serialize on one another.
//!
//! Lock order: jobs, then pool queue or memory cache. Auth, context and the
//! failure lists are leaf locks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use stoker_core::config::validate_config;
use stoker_core::{Config, EngineConfig};
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthRequest, AuthSource, AuthState, AuthenticationStatus};
use crate::cache::{DiskCache, MemoryCache, MemoryCacheSnapshot, MutableDataCache, MutableUpdateSender};
use crate::context::{
    ContextRequestParameters, ContextRequestStatus, ContextState, FrameworkContext,
    FrameworkUsageInfo,
};
use crate::graph::JobGraph;
use crate::handle::JobHandle;
use crate::job::{DiskCodec, Fingerprint, JobContext, JobDefinition, JobError, JobKind, JobOutput, JobState};
use crate::pool::{PoolPolicy, WorkHandler, WorkerPool};
use crate::remote::{Credentials, OfflineRemoteService, RemoteService, Session};
use crate::reporter::{JobEvent, JobReporter, JobReporterRegistry, ResultSource};
use crate::resolver::{Cascaded, ClaimOutcome, DependencyResolver};
use crate::status::{EngineStatus, FailureLog, JobFailure};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// An item on a pool queue
enum Work {
    /// Run the job with this fingerprint
    Job(Fingerprint),
    /// Engine-internal task (authentication, context resolution)
    Background(Box<dyn FnOnce() + Send>),
}

/// What submitting one job did to the job table
enum Admission {
    /// Attached to an in-flight job, or refused after shutdown
    Attached(JobHandle),
    Cached {
        handle: JobHandle,
        fingerprint: Fingerprint,
        label: String,
    },
    Admitted {
        handle: JobHandle,
        fingerprint: Fingerprint,
        kind: JobKind,
        label: String,
        ready: bool,
    },
    Rejected {
        handle: JobHandle,
        fingerprint: Fingerprint,
        kind: JobKind,
        label: String,
        dependency: Fingerprint,
    },
}

fn pool_policy(config: &EngineConfig, kind: JobKind) -> PoolPolicy {
    match kind {
        JobKind::Cpu => PoolPolicy::Fixed(config.effective_cpu_threads()),
        JobKind::Disk => PoolPolicy::Fixed(config.disk_threads),
        JobKind::WebRead | JobKind::WebWrite => PoolPolicy::Elastic {
            max_threads: config.web_max_threads,
            idle_timeout: Duration::from_secs(config.web_idle_timeout_secs),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct EngineInner {
    this: Weak<EngineInner>,
    config: Config,
    pools: [WorkerPool<Work>; 4],
    jobs: Mutex<DependencyResolver>,
    /// Signaled whenever a job leaves the executing state
    jobs_idle: Condvar,
    memory: Arc<MemoryCache>,
    disk: RwLock<Option<Arc<dyn DiskCache>>>,
    mutable: MutableDataCache,
    failures: FailureLog,
    auth: Mutex<AuthState>,
    context: Mutex<ContextState>,
    remote: Arc<dyn RemoteService>,
    reporters: JobReporterRegistry,
    shut_down: AtomicBool,
}

impl EngineInner {
    fn new(
        config: Config,
        remote: Arc<dyn RemoteService>,
        reporters: JobReporterRegistry,
        disk: Option<Arc<dyn DiskCache>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<EngineInner>| {
            let pools = JobKind::ALL.map(|kind| {
                WorkerPool::new(
                    kind.as_str(),
                    pool_policy(&config.engine, kind),
                    work_handler(this.clone()),
                )
            });
            Self {
                this: this.clone(),
                pools,
                jobs: Mutex::new(DependencyResolver::default()),
                jobs_idle: Condvar::new(),
                memory: Arc::new(MemoryCache::new()),
                disk: RwLock::new(disk),
                mutable: MutableDataCache::new(),
                failures: FailureLog::default(),
                auth: Mutex::new(AuthState::default()),
                context: Mutex::new(ContextState::default()),
                remote,
                reporters,
                shut_down: AtomicBool::new(false),
                config,
            }
        })
    }

    fn jobs(&self) -> MutexGuard<'_, DependencyResolver> {
        lock(&self.jobs)
    }

    fn auth(&self) -> MutexGuard<'_, AuthState> {
        lock(&self.auth)
    }

    fn context(&self) -> MutexGuard<'_, ContextState> {
        lock(&self.context)
    }

    fn pool(&self, kind: JobKind) -> &WorkerPool<Work> {
        &self.pools[kind.index()]
    }

    fn disk_cache(&self) -> Option<Arc<dyn DiskCache>> {
        self.disk
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn enqueue(&self, kind: JobKind, fingerprint: Fingerprint) {
        trace!(fingerprint = %fingerprint.short(), kind = %kind, "job queued");
        self.pool(kind).push(Work::Job(fingerprint));
    }

    fn submit(&self, definition: JobDefinition) -> JobHandle {
        let admission = {
            let mut jobs = self.jobs();
            self.admit_job(&mut jobs, definition)
        };
        self.settle(admission)
    }

    /// Admit a batch in dependency order under one hold of the job table.
    /// No job of the batch is queued until every one of them is admitted,
    /// so a dependency cannot finish before its dependents attach to it.
    fn submit_batch(
        &self,
        definitions: Vec<(String, JobDefinition)>,
    ) -> HashMap<String, JobHandle> {
        let admissions: Vec<(String, Admission)> = {
            let mut jobs = self.jobs();
            definitions
                .into_iter()
                .map(|(name, definition)| (name, self.admit_job(&mut jobs, definition)))
                .collect()
        };
        admissions
            .into_iter()
            .map(|(name, admission)| (name, self.settle(admission)))
            .collect()
    }

    fn admit_job(&self, jobs: &mut DependencyResolver, definition: JobDefinition) -> Admission {
        let fingerprint = definition.fingerprint();
        let kind = definition.kind();
        let label = definition.label().to_string();
        let cache_ref = self.memory.acquire(fingerprint);

        if self.shut_down.load(Ordering::SeqCst) {
            return Admission::Attached(JobHandle::resolved(JobState::Canceled, cache_ref));
        }

        if self.memory.get_fresh(&fingerprint).is_some() {
            return Admission::Cached {
                handle: JobHandle::resolved(JobState::Succeeded, cache_ref),
                fingerprint,
                label,
            };
        }

        if let Some(receiver) = jobs.subscribe(&fingerprint) {
            trace!(fingerprint = %fingerprint.short(), "attached to in-flight job");
            return Admission::Attached(JobHandle::new(receiver, cache_ref));
        }

        match jobs.admit(definition, &self.memory) {
            Ok(admitted) => Admission::Admitted {
                handle: JobHandle::new(admitted.receiver, cache_ref),
                fingerprint,
                kind,
                label,
                ready: admitted.state == JobState::Ready,
            },
            Err(rejected) => Admission::Rejected {
                handle: JobHandle::resolved(JobState::FailedPermanent, cache_ref),
                fingerprint,
                kind,
                label,
                dependency: rejected.dependency,
            },
        }
    }

    /// Report an admission and queue the job if it is ready.
    /// Called without the job table lock.
    fn settle(&self, admission: Admission) -> JobHandle {
        match admission {
            Admission::Attached(handle) => handle,
            Admission::Cached {
                handle,
                fingerprint,
                label,
            } => {
                self.reporters.broadcast(&JobEvent::Completed {
                    fingerprint,
                    label,
                    source: ResultSource::MemoryCache,
                    duration: Duration::ZERO,
                });
                handle
            }
            Admission::Admitted {
                handle,
                fingerprint,
                kind,
                label,
                ready,
            } => {
                self.reporters.broadcast(&JobEvent::Submitted {
                    fingerprint,
                    kind,
                    label,
                });
                if ready {
                    self.enqueue(kind, fingerprint);
                }
                handle
            }
            Admission::Rejected {
                handle,
                fingerprint,
                kind,
                label,
                dependency,
            } => {
                self.failures.record(
                    false,
                    JobFailure {
                        fingerprint,
                        kind,
                        label: label.clone(),
                        message: format!(
                            "dependency {} has no result and is not pending",
                            dependency.short()
                        ),
                        failed_at: Utc::now(),
                    },
                );
                self.reporters.broadcast(&JobEvent::DependencyFailed {
                    fingerprint,
                    label,
                    dependency,
                    transient: false,
                });
                handle
            }
        }
    }

    /// Worker-side execution of one queued job
    fn execute(&self, fingerprint: Fingerprint) {
        let outcome = self.jobs().claim(&fingerprint, &self.memory);
        let claim = match outcome {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::Skipped => return,
            ClaimOutcome::MissingDependency {
                kind,
                label,
                dependency,
            } => {
                let message = format!("result of dependency {} was lost", dependency.short());
                self.finish_failed(fingerprint, kind, label, false, message, Duration::ZERO);
                return;
            }
        };

        let kind = claim.kind;
        let label = claim.label;
        self.reporters.broadcast(&JobEvent::Started {
            fingerprint,
            kind,
            label: label.clone(),
        });
        let started = Instant::now();

        if let Some(codec) = &claim.codec {
            if let Some(output) = self.probe_disk(&fingerprint, codec) {
                self.finish_succeeded(fingerprint, label, output, ResultSource::DiskCache, started);
                return;
            }
        }

        let (session, framework_context) = if kind.is_web() {
            (
                self.auth().session().cloned(),
                self.context().context().cloned(),
            )
        } else {
            (None, None)
        };
        let ctx = JobContext::new(
            fingerprint,
            kind,
            claim.cancel.clone(),
            claim.dependencies,
            session,
            framework_context,
        );

        let run = claim.run;
        let result = panic::catch_unwind(AssertUnwindSafe(|| run(&ctx))).unwrap_or_else(|payload| {
            Err(JobError::permanent(format!(
                "job panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        match result {
            Ok(output) => {
                if let Some(codec) = &claim.codec {
                    self.write_through(&fingerprint, codec, &output);
                }
                self.finish_succeeded(fingerprint, label, output, ResultSource::Executed, started);
            }
            Err(_) if claim.cancel.is_cancelled() => self.finish_canceled(fingerprint, label),
            Err(JobError::Canceled) => self.finish_canceled(fingerprint, label),
            Err(JobError::SessionExpired(message)) => {
                self.session_expired(&message);
                let message = format!("session expired: {}", message);
                self.finish_failed(fingerprint, kind, label, true, message, started.elapsed());
            }
            Err(JobError::Transient(message)) => {
                self.finish_failed(fingerprint, kind, label, true, message, started.elapsed());
            }
            Err(JobError::Permanent(message)) => {
                self.finish_failed(fingerprint, kind, label, false, message, started.elapsed());
            }
        }
    }

    fn probe_disk(&self, fingerprint: &Fingerprint, codec: &DiskCodec) -> Option<JobOutput> {
        let disk = self.disk_cache()?;
        match disk.load(fingerprint) {
            Ok(Some(bytes)) => match codec.decode(&bytes) {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!(fingerprint = %fingerprint.short(), error = %e, "undecodable disk cache entry, executing");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "disk cache read failed, executing");
                None
            }
        }
    }

    fn write_through(&self, fingerprint: &Fingerprint, codec: &DiskCodec, output: &JobOutput) {
        let Some(disk) = self.disk_cache() else {
            return;
        };
        let stored = codec
            .encode(output)
            .map_err(stoker_core::CacheError::from)
            .and_then(|bytes| disk.store(fingerprint, output.type_name(), &bytes));
        if let Err(e) = stored {
            warn!(fingerprint = %fingerprint.short(), error = %e, "failed to persist result to disk cache");
        }
    }

    fn finish_succeeded(
        &self,
        fingerprint: Fingerprint,
        label: String,
        output: JobOutput,
        source: ResultSource,
        started: Instant,
    ) {
        self.memory.insert(fingerprint, output);
        self.reporters.broadcast(&JobEvent::Completed {
            fingerprint,
            label,
            source,
            duration: started.elapsed(),
        });

        {
            let mut jobs = self.jobs();
            for (dependent, kind) in jobs.complete(&fingerprint) {
                self.enqueue(kind, dependent);
            }
        }
        self.jobs_idle.notify_all();
        self.enforce_memory_limit();
    }

    fn finish_failed(
        &self,
        fingerprint: Fingerprint,
        kind: JobKind,
        label: String,
        transient: bool,
        message: String,
        duration: Duration,
    ) {
        self.reporters.broadcast(&JobEvent::Failed {
            fingerprint,
            label: label.clone(),
            transient,
            error: message.clone(),
            duration,
        });
        self.failures.record(
            transient,
            JobFailure {
                fingerprint,
                kind,
                label,
                message,
                failed_at: Utc::now(),
            },
        );

        let cascaded = self.jobs().fail(&fingerprint, transient);
        self.jobs_idle.notify_all();
        self.record_cascade(cascaded);
    }

    fn finish_canceled(&self, fingerprint: Fingerprint, label: String) {
        let cascaded = self.jobs().finish_canceled(&fingerprint);
        self.jobs_idle.notify_all();
        self.reporters
            .broadcast(&JobEvent::Canceled { fingerprint, label });
        self.record_cascade(cascaded);
    }

    /// Report jobs failed by a dependency, then release their handles
    fn record_cascade(&self, cascaded: Vec<Cascaded>) {
        for job in cascaded {
            let transient = job.state == JobState::FailedTransient;
            self.reporters.broadcast(&JobEvent::DependencyFailed {
                fingerprint: job.fingerprint,
                label: job.label.clone(),
                dependency: job.dependency,
                transient,
            });
            self.failures.record(
                transient,
                JobFailure {
                    fingerprint: job.fingerprint,
                    kind: job.kind,
                    label: job.label.clone(),
                    message: format!("dependency {} did not succeed", job.dependency.short()),
                    failed_at: Utc::now(),
                },
            );
            job.notify();
        }
    }

    fn enforce_memory_limit(&self) {
        let Some(limit_mb) = self.config.cache.memory_limit_mb else {
            return;
        };
        let limit = usize::try_from(limit_mb.saturating_mul(BYTES_PER_MB)).unwrap_or(usize::MAX);
        if self.memory.total_bytes() > limit {
            self.memory.reduce_to(limit);
        }
    }

    fn cancel_job(&self, fingerprint: &Fingerprint) -> bool {
        let (found, cascaded) = self.jobs().cancel(fingerprint);
        self.record_cascade(cascaded);
        found
    }

    fn clear_pending_jobs(&self) -> usize {
        let canceled = {
            let mut jobs = self.jobs();
            let canceled = jobs.cancel_pending();
            for pool in &self.pools {
                pool.drain_where(|work| matches!(work, Work::Job(_)));
            }
            canceled
        };

        self.report_canceled(&canceled);
        if !canceled.is_empty() {
            info!(count = canceled.len(), "pending jobs canceled");
        }
        canceled.len()
    }

    fn report_canceled(&self, canceled: &[(Fingerprint, String)]) {
        for (fingerprint, label) in canceled {
            self.reporters.broadcast(&JobEvent::Canceled {
                fingerprint: *fingerprint,
                label: label.clone(),
            });
        }
    }

    fn clear_all_jobs(&self) {
        self.clear_pending_jobs();

        let mut jobs = self.jobs();
        let interrupted = jobs.interrupt_executing();
        if interrupted > 0 {
            info!(interrupted, "waiting for executing jobs to stop");
        }
        let _jobs = self
            .jobs_idle
            .wait_while(jobs, |jobs| jobs.executing() > 0)
            .unwrap_or_else(PoisonError::into_inner);
        debug!("all jobs cleared");
    }

    fn update_status(&self, status: &mut EngineStatus) {
        for kind in JobKind::ALL {
            status.queues.insert(kind, self.pool(kind).status().into());
        }
        status.transient_failures = self.failures.drain_transient();
        status.jobs = self.jobs().info();
    }

    fn run_background(&self, kind: JobKind, task: impl FnOnce(&EngineInner) + Send + 'static) {
        let this = self.this.clone();
        let queued = self.pool(kind).push(Work::Background(Box::new(move || {
            if let Some(inner) = this.upgrade() {
                task(inner.as_ref());
            }
        })));
        if !queued {
            debug!(kind = %kind, "engine shut down, background task dropped");
        }
    }

    fn schedule_auth(&self, request: AuthRequest) {
        self.run_background(JobKind::WebWrite, move |inner| {
            let outcome = match &request.source {
                AuthSource::Credentials {
                    api_url,
                    credentials,
                } => inner.remote.authenticate(api_url, credentials),
                AuthSource::Token { api_url, token } => {
                    inner.remote.authenticate_token(api_url.as_deref(), token)
                }
            };
            inner.auth().complete(request.generation, outcome);
        });
    }

    fn session_expired(&self, message: &str) {
        let request = self.auth().expire(message);
        if let Some(request) = request {
            info!("session expired, re-authenticating");
            self.schedule_auth(request);
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down engine");

        let canceled = {
            let mut jobs = self.jobs();
            let canceled = jobs.cancel_pending();
            jobs.interrupt_executing();
            canceled
        };
        self.report_canceled(&canceled);
        for pool in &self.pools {
            pool.shutdown();
        }
        self.jobs_idle.notify_all();
        debug!("engine shut down");
    }
}

fn work_handler(engine: Weak<EngineInner>) -> WorkHandler<Work> {
    Arc::new(move |work: Work| match work {
        Work::Background(task) => task(),
        Work::Job(fingerprint) => {
            if let Some(inner) = engine.upgrade() {
                inner.execute(fingerprint);
            }
        }
    })
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: Config,
    remote: Arc<dyn RemoteService>,
    reporters: JobReporterRegistry,
    disk_cache: Option<Arc<dyn DiskCache>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            remote: Arc::new(OfflineRemoteService),
            reporters: JobReporterRegistry::new(),
            disk_cache: None,
        }
    }

    /// Remote service used for authentication and context resolution
    pub fn with_remote(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = remote;
        self
    }

    /// Replace the reporter registry (the default logs through tracing)
    pub fn with_reporters(mut self, reporters: JobReporterRegistry) -> Self {
        self.reporters = reporters;
        self
    }

    /// Add one reporter to the registry
    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporters.register_shared(reporter);
        self
    }

    /// Attach a disk cache from the start
    pub fn with_disk_cache(mut self, cache: Arc<dyn DiskCache>) -> Self {
        self.disk_cache = Some(cache);
        self
    }

    /// Validate the configuration and start the pools
    pub fn build(self) -> stoker_core::Result<Engine> {
        validate_config(&self.config)?;
        let inner = EngineInner::new(self.config, self.remote, self.reporters, self.disk_cache);
        info!(
            cpu_threads = inner.pool(JobKind::Cpu).status().total_threads,
            disk_threads = inner.pool(JobKind::Disk).status().total_threads,
            "engine started"
        );
        Ok(Engine { inner })
    }
}

/// Handle to the background engine. Dropping it shuts the engine down.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start an engine with the default reporters and no disk cache
    pub fn new(config: Config, remote: Arc<dyn RemoteService>) -> stoker_core::Result<Self> {
        EngineBuilder::new(config).with_remote(remote).build()
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Submit a job.
    ///
    /// A fingerprint that is cached resolves immediately; one that is
    /// already pending or executing attaches to the existing job.
    pub fn submit(&self, definition: JobDefinition) -> JobHandle {
        self.inner.submit(definition)
    }

    /// Submit every job of a graph in dependency order
    pub fn submit_graph(&self, graph: JobGraph) -> HashMap<String, JobHandle> {
        self.inner.submit_batch(graph.into_definitions())
    }

    /// Cancel one job and fail its dependents. Returns false when the job
    /// was not pending or executing.
    pub fn cancel_job(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.cancel_job(fingerprint)
    }

    /// Cancel every job that has not started executing
    pub fn clear_pending_jobs(&self) -> usize {
        self.inner.clear_pending_jobs()
    }

    /// Cancel pending jobs, interrupt executing ones and block until every
    /// worker has let go of its job.
    ///
    /// Must not be called from inside a job.
    pub fn clear_all_jobs(&self) {
        self.inner.clear_all_jobs()
    }

    /// Forget canceled jobs
    pub fn clear_canceled_jobs(&self) -> usize {
        self.inner.jobs().purge_canceled()
    }

    /// Refresh `status` with queue counters, the transient failures recorded
    /// since the previous call, and the jobs still being tracked
    pub fn update_status(&self, status: &mut EngineStatus) {
        self.inner.update_status(status)
    }

    /// Permanent failures since the previous call
    pub fn get_permanent_failures(&self) -> Vec<JobFailure> {
        self.inner.failures.drain_permanent()
    }

    pub fn get_memory_cache_snapshot(&self) -> MemoryCacheSnapshot {
        self.inner.memory.snapshot()
    }

    pub fn clear_memory_cache(&self) {
        self.inner.memory.clear();
    }

    /// Evict unreferenced results until the cache is at most
    /// `desired_size_mb`; returns the number of evicted entries
    pub fn reduce_memory_cache_size(&self, desired_size_mb: u64) -> usize {
        let target = usize::try_from(desired_size_mb.saturating_mul(BYTES_PER_MB)).unwrap_or(usize::MAX);
        self.inner.memory.reduce_to(target)
    }

    /// Attach or detach the disk cache; running jobs are unaffected
    pub fn set_disk_cache(&self, cache: Option<Arc<dyn DiskCache>>) {
        *self
            .inner
            .disk
            .write()
            .unwrap_or_else(PoisonError::into_inner) = cache;
    }

    pub fn get_disk_cache(&self) -> Option<Arc<dyn DiskCache>> {
        self.inner.disk_cache()
    }

    /// Authenticate with credentials in the background
    pub fn set_authentication_info(&self, api_url: impl Into<String>, credentials: Credentials) {
        let request = self.inner.auth().begin(AuthSource::Credentials {
            api_url: api_url.into(),
            credentials,
        });
        self.inner.schedule_auth(request);
    }

    /// Authenticate with a pre-issued token against the last used API URL,
    /// falling back to the configured one
    pub fn set_authentication_token(&self, token: impl Into<String>) {
        let request = {
            let mut auth = self.inner.auth();
            let api_url = auth
                .api_url()
                .map(str::to_string)
                .or_else(|| self.inner.config.remote.api_url.clone());
            auth.begin(AuthSource::Token {
                api_url,
                token: token.into(),
            })
        };
        self.inner.schedule_auth(request);
    }

    pub fn get_authentication_status(&self) -> AuthenticationStatus {
        self.inner.auth().status()
    }

    /// Detail of the last authentication failure
    pub fn get_authentication_message(&self) -> Option<String> {
        self.inner.auth().message().map(str::to_string)
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.auth().session().cloned()
    }

    pub fn clear_authentication_info(&self) {
        self.inner.auth().clear();
    }

    /// Resolve a realm into a framework context in the background
    pub fn set_context_request_parameters(
        &self,
        framework: FrameworkUsageInfo,
        params: ContextRequestParameters,
    ) {
        let request = self.inner.context().begin(framework, params);
        self.inner.run_background(JobKind::WebRead, move |inner| {
            let session = inner.auth().session().cloned();
            let outcome =
                inner
                    .remote
                    .resolve_context(session.as_ref(), &request.framework, &request.params);
            inner.context().complete(request.generation, outcome);
        });
    }

    pub fn get_context_request_status(&self) -> ContextRequestStatus {
        self.inner.context().status()
    }

    /// Why the last context request failed, if it did
    pub fn get_context_request_message(&self) -> Option<String> {
        self.inner.context().message().map(str::to_string)
    }

    pub fn get_context_request_result(&self) -> (ContextRequestStatus, Option<FrameworkContext>) {
        let context = self.inner.context();
        (context.status(), context.context().cloned())
    }

    /// Install a pre-resolved context without a background request
    pub fn set_framework_context(&self, context: FrameworkContext) {
        self.inner.context().set(context);
    }

    pub fn clear_framework_context(&self) {
        self.inner.context().clear();
    }

    /// Apply queued external change notifications
    pub fn process_mutable_cache_updates(&self) -> usize {
        self.inner.mutable.process_updates()
    }

    pub fn clear_mutable_data_cache(&self) -> usize {
        self.inner.mutable.clear()
    }

    pub fn mutable_data_cache(&self) -> &MutableDataCache {
        &self.inner.mutable
    }

    pub fn mutable_update_sender(&self) -> MutableUpdateSender {
        self.inner.mutable.sender()
    }

    /// Cancel everything, stop the pools and join their threads
    pub fn shutdown(&self) {
        self.inner.shutdown()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.engine.cpu_threads = Some(2);
        config.engine.disk_threads = 1;
        config
    }

    fn engine() -> Engine {
        Engine::builder(test_config())
            .with_reporters(JobReporterRegistry::empty())
            .build()
            .unwrap()
    }

    #[test]
    fn test_pool_policies() {
        let config = EngineConfig {
            cpu_threads: Some(3),
            disk_threads: 2,
            web_max_threads: 8,
            web_idle_timeout_secs: 5,
        };
        assert_eq!(pool_policy(&config, JobKind::Cpu), PoolPolicy::Fixed(3));
        assert_eq!(pool_policy(&config, JobKind::Disk), PoolPolicy::Fixed(2));
        assert_eq!(
            pool_policy(&config, JobKind::WebRead),
            PoolPolicy::Elastic {
                max_threads: 8,
                idle_timeout: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.engine.disk_threads = 0;
        assert!(Engine::new(config, Arc::new(OfflineRemoteService)).is_err());
    }

    #[tokio::test]
    async fn test_submit_and_read_result() {
        let engine = engine();
        let fp = Fingerprint::new(JobKind::Cpu, "square");
        let handle = engine.submit(JobDefinition::new(JobKind::Cpu, fp, |_| Ok(7u64 * 7)));

        assert_eq!(handle.wait().await, JobState::Succeeded);
        assert_eq!(*handle.result::<u64>().unwrap(), 49);

        // a second submission resolves from the memory cache
        let again = engine.submit(JobDefinition::new(JobKind::Cpu, fp, |_| -> Result<u64, JobError> {
            panic!("must not run")
        }));
        assert_eq!(again.state(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_panicking_job_fails_permanently() {
        let engine = engine();
        let fp = Fingerprint::new(JobKind::Cpu, "panics");
        let handle = engine.submit(JobDefinition::new(JobKind::Cpu, fp, |_| -> Result<u64, JobError> {
            panic!("bad input")
        }));

        assert_eq!(handle.wait().await, JobState::FailedPermanent);
        let failures = engine.get_permanent_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("bad input"));

        // the pool keeps serving jobs
        let ok = engine.submit(JobDefinition::new(
            JobKind::Cpu,
            Fingerprint::new(JobKind::Cpu, "after"),
            |_| Ok(1u64),
        ));
        assert_eq!(ok.wait().await, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_failure_reported_in_status() {
        let engine = engine();
        let fp = Fingerprint::new(JobKind::WebRead, "flaky");
        let handle = engine.submit(JobDefinition::new(JobKind::WebRead, fp, |_| -> Result<u64, JobError> {
            Err(JobError::transient("connection reset"))
        }));
        assert_eq!(handle.wait().await, JobState::FailedTransient);

        let mut status = EngineStatus::default();
        engine.update_status(&mut status);
        assert_eq!(status.transient_failures.len(), 1);
        assert_eq!(status.transient_failures[0].message, "connection reset");
        assert_eq!(status.queues.len(), 4);

        engine.update_status(&mut status);
        assert!(status.transient_failures.is_empty());
        assert!(engine.get_permanent_failures().is_empty());
    }

    #[tokio::test]
    async fn test_reporter_sees_lifecycle() {
        let collecting = Arc::new(CollectingReporter::default());
        let engine = Engine::builder(test_config())
            .with_reporters(JobReporterRegistry::empty())
            .with_reporter(collecting.clone())
            .build()
            .unwrap();

        let handle = engine.submit(JobDefinition::new(
            JobKind::Cpu,
            Fingerprint::new(JobKind::Cpu, "events"),
            |_| Ok(1u64),
        ));
        handle.wait().await;

        let events = collecting.events();
        assert!(events.iter().any(|e| matches!(e, JobEvent::Submitted { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Completed {
                source: ResultSource::Executed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_framework_context_reaches_web_jobs() {
        let engine = engine();
        engine.set_framework_context(FrameworkContext {
            api_url: "https://calc.example.com".to_string(),
            realm_id: "clinic".to_string(),
            context_id: "ctx-9".to_string(),
        });

        let handle = engine.submit(JobDefinition::new(
            JobKind::WebRead,
            Fingerprint::new(JobKind::WebRead, "ctx"),
            |ctx| Ok(ctx.require_framework_context()?.context_id.clone()),
        ));
        assert_eq!(handle.wait().await, JobState::Succeeded);
        assert_eq!(handle.result::<String>().unwrap().as_str(), "ctx-9");
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_canceled() {
        let engine = engine();
        engine.shutdown();
        let handle = engine.submit(JobDefinition::new(
            JobKind::Cpu,
            Fingerprint::new(JobKind::Cpu, "late"),
            |_| Ok(1u64),
        ));
        assert_eq!(handle.wait().await, JobState::Canceled);
    }
}
