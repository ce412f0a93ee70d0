//! Job types and definitions

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::context::FrameworkContext;
use crate::remote::Session;

/// The kind of work a job performs; selects the pool that runs it
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pure CPU calculation
    Cpu,
    /// Remote query that only reads
    WebRead,
    /// Remote request with side effects
    WebWrite,
    /// Local disk read/write
    Disk,
}

impl JobKind {
    /// Every job kind, in pool order
    pub const ALL: [JobKind; 4] = [Self::Cpu, Self::WebRead, Self::WebWrite, Self::Disk];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::WebRead => "web_read",
            Self::WebWrite => "web_write",
            Self::Disk => "disk",
        }
    }

    /// Whether jobs of this kind talk to the remote service
    pub fn is_web(&self) -> bool {
        matches!(self, Self::WebRead | Self::WebWrite)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::WebRead => 1,
            Self::WebWrite => 2,
            Self::Disk => 3,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-derived identity of a job: SHA-256 over its kind and inputs
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint raw input bytes for a job kind
    pub fn new(kind: JobKind, inputs: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(inputs.as_ref());
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    /// Fingerprint any serializable input value
    pub fn of<I: Serialize + ?Sized>(kind: JobKind, inputs: &I) -> serde_json::Result<Self> {
        let encoded = serde_json::to_vec(inputs)?;
        Ok(Self::new(kind, encoded))
    }

    /// Abbreviated hex form for logs
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Lifecycle of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Held until every dependency has a readable result
    WaitingOnDependencies,
    /// Queued in its pool
    Ready,
    /// Claimed by a worker thread
    Executing,
    /// Result committed to the memory cache
    Succeeded,
    /// Failed in a way that may succeed on resubmission
    FailedTransient,
    /// Failed in a way retrying will not fix
    FailedPermanent,
    /// Canceled before or during execution
    Canceled,
}

impl JobState {
    /// Whether the job will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedTransient | Self::FailedPermanent | Self::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingOnDependencies => "waiting_on_dependencies",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a job closure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Network hiccup, contention; the caller may resubmit
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid input or unrecoverable protocol error
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The remote session is no longer valid
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The job observed a cancellation request
    #[error("job canceled")]
    Canceled,
}

impl JobError {
    /// Creates a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }
}

/// A job result that can be held in the memory cache.
///
/// `size_bytes` feeds the cache's size accounting; it should approximate the
/// heap footprint of the value.
pub trait Payload: Any + Send + Sync {
    /// Estimated size of the value in bytes
    fn size_bytes(&self) -> usize;
}

impl Payload for String {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl<T: Copy + Send + Sync + 'static> Payload for Vec<T> {
    fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}

macro_rules! scalar_payload {
    ($($ty:ty),*) => {
        $(impl Payload for $ty {
            fn size_bytes(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        })*
    };
}

scalar_payload!(bool, u32, u64, usize, i32, i64, f32, f64, ());

/// Type-erased job result
#[derive(Clone)]
pub struct JobOutput {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    size_bytes: usize,
}

impl JobOutput {
    /// Wrap a payload
    pub fn new<T: Payload>(value: T) -> Self {
        Self {
            size_bytes: value.size_bytes(),
            type_name: type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// Typed view of the value, if it is a `T`
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Declared type of the payload
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Accounted size of the payload
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl fmt::Debug for JobOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOutput")
            .field("type_name", &self.type_name)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

type EncodeFn = dyn Fn(&JobOutput) -> serde_json::Result<Vec<u8>> + Send + Sync;
type DecodeFn = dyn Fn(&[u8]) -> serde_json::Result<JobOutput> + Send + Sync;

/// Converts a job's result to and from its persisted form
pub(crate) struct DiskCodec {
    encode: Box<EncodeFn>,
    decode: Box<DecodeFn>,
}

impl DiskCodec {
    fn json<T: Payload + Serialize + DeserializeOwned>() -> Self {
        Self {
            encode: Box::new(|output: &JobOutput| match output.downcast::<T>() {
                Some(value) => serde_json::to_vec(&*value),
                None => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                    "expected {}, found {}",
                    type_name::<T>(),
                    output.type_name()
                ))),
            }),
            decode: Box::new(|bytes: &[u8]| serde_json::from_slice::<T>(bytes).map(JobOutput::new)),
        }
    }

    pub(crate) fn encode(&self, output: &JobOutput) -> serde_json::Result<Vec<u8>> {
        (self.encode)(output)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> serde_json::Result<JobOutput> {
        (self.decode)(bytes)
    }
}

pub(crate) type JobFn = Box<dyn FnOnce(&JobContext) -> Result<JobOutput, JobError> + Send>;

/// A unit of schedulable work.
///
/// The closure receives a [`JobContext`] carrying the resolved dependency
/// results and the job's cancellation token.
pub struct JobDefinition {
    fingerprint: Fingerprint,
    kind: JobKind,
    label: String,
    dependencies: Vec<Fingerprint>,
    run: JobFn,
    codec: Option<Arc<DiskCodec>>,
}

impl JobDefinition {
    /// Create a job whose result lives only in the memory cache
    pub fn new<T, F>(kind: JobKind, fingerprint: Fingerprint, run: F) -> Self
    where
        T: Payload,
        F: FnOnce(&JobContext) -> Result<T, JobError> + Send + 'static,
    {
        Self {
            fingerprint,
            kind,
            label: fingerprint.short(),
            dependencies: Vec::new(),
            run: Box::new(move |ctx: &JobContext| run(ctx).map(JobOutput::new)),
            codec: None,
        }
    }

    /// Create a job whose result is also written through to the disk cache
    /// and probed there before executing
    pub fn cacheable<T, F>(kind: JobKind, fingerprint: Fingerprint, run: F) -> Self
    where
        T: Payload + Serialize + DeserializeOwned,
        F: FnOnce(&JobContext) -> Result<T, JobError> + Send + 'static,
    {
        let mut definition = Self::new(kind, fingerprint, run);
        definition.codec = Some(Arc::new(DiskCodec::json::<T>()));
        definition
    }

    /// Set a human-readable label used in status and logs
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Add a dependency on another job's result
    pub fn depends_on(mut self, dependency: Fingerprint) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dependencies(&self) -> &[Fingerprint] {
        &self.dependencies
    }

    /// Whether the result is persisted to the disk cache
    pub fn is_cacheable(&self) -> bool {
        self.codec.is_some()
    }

    pub(crate) fn into_parts(self) -> (JobFn, Option<Arc<DiskCodec>>) {
        (self.run, self.codec)
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("fingerprint", &self.fingerprint)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("dependencies", &self.dependencies)
            .field("cacheable", &self.is_cacheable())
            .finish()
    }
}

/// Execution context handed to a job closure
pub struct JobContext {
    fingerprint: Fingerprint,
    kind: JobKind,
    cancel: CancellationToken,
    dependencies: Vec<(Fingerprint, JobOutput)>,
    session: Option<Session>,
    framework_context: Option<FrameworkContext>,
}

impl JobContext {
    pub(crate) fn new(
        fingerprint: Fingerprint,
        kind: JobKind,
        cancel: CancellationToken,
        dependencies: Vec<(Fingerprint, JobOutput)>,
        session: Option<Session>,
        framework_context: Option<FrameworkContext>,
    ) -> Self {
        Self {
            fingerprint,
            kind,
            cancel,
            dependencies,
            session,
            framework_context,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Typed result of a dependency
    pub fn dependency<T: Any + Send + Sync>(&self, fingerprint: &Fingerprint) -> Option<Arc<T>> {
        self.dependencies
            .iter()
            .find(|(fp, _)| fp == fingerprint)
            .and_then(|(_, output)| output.downcast::<T>())
    }

    /// Dependency results in declaration order
    pub fn dependency_outputs(&self) -> impl Iterator<Item = (&Fingerprint, &JobOutput)> {
        self.dependencies.iter().map(|(fp, output)| (fp, output))
    }

    /// Whether cancellation has been requested
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point for long-running jobs: bails out once canceled
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Authenticated session, available to web jobs
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Resolved realm context, available to web jobs
    pub fn framework_context(&self) -> Option<&FrameworkContext> {
        self.framework_context.as_ref()
    }

    /// The realm context, or a transient failure when none is resolved yet
    pub fn require_framework_context(&self) -> Result<&FrameworkContext, JobError> {
        self.framework_context
            .as_ref()
            .ok_or_else(|| JobError::transient("no framework context resolved"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = Fingerprint::new(JobKind::Cpu, "f1");
        let b = Fingerprint::new(JobKind::Cpu, "f1");
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 64);
    }

    #[test]
    fn test_fingerprint_includes_kind() {
        let cpu = Fingerprint::new(JobKind::Cpu, "f1");
        let disk = Fingerprint::new(JobKind::Disk, "f1");
        assert_ne!(cpu, disk);
    }

    #[test]
    fn test_fingerprint_of_serializable() {
        let a = Fingerprint::of(JobKind::WebRead, &("dose", 42)).unwrap();
        let b = Fingerprint::of(JobKind::WebRead, &("dose", 43)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::WaitingOnDependencies.is_terminal());
        assert!(!JobState::Ready.is_terminal());
        assert!(!JobState::Executing.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::FailedTransient.is_terminal());
        assert!(JobState::FailedPermanent.is_terminal());
        assert!(JobState::Canceled.is_terminal());
    }

    #[test]
    fn test_job_output_downcast() {
        let output = JobOutput::new(String::from("hello"));
        assert_eq!(output.size_bytes(), 5);
        assert_eq!(output.downcast::<String>().unwrap().as_str(), "hello");
        assert!(output.downcast::<u64>().is_none());
    }

    #[test]
    fn test_vec_payload_size() {
        assert_eq!(vec![0u8; 1024].size_bytes(), 1024);
        assert_eq!(vec![0f64; 4].size_bytes(), 32);
    }

    #[test]
    fn test_definition_builder() {
        let dep = Fingerprint::new(JobKind::Disk, "volume");
        let def = JobDefinition::new(JobKind::Cpu, Fingerprint::new(JobKind::Cpu, "dose"), |_| {
            Ok(1u64)
        })
        .with_label("dose grid")
        .depends_on(dep)
        .depends_on(dep);

        assert_eq!(def.label(), "dose grid");
        assert_eq!(def.dependencies(), &[dep]);
        assert!(!def.is_cacheable());
    }

    #[test]
    fn test_cacheable_codec() {
        let fp = Fingerprint::new(JobKind::Disk, "blob");
        let def = JobDefinition::cacheable(JobKind::Disk, fp, |_| Ok(String::from("blob")));
        assert!(def.is_cacheable());

        let (_, codec) = def.into_parts();
        let codec = codec.unwrap();
        let bytes = codec.encode(&JobOutput::new(String::from("blob"))).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast::<String>().unwrap().as_str(), "blob");
        assert!(codec.encode(&JobOutput::new(7u64)).is_err());
    }

    #[test]
    fn test_context_checkpoint() {
        let token = CancellationToken::new();
        let dep = Fingerprint::new(JobKind::Cpu, "dep");
        let ctx = JobContext::new(
            Fingerprint::new(JobKind::Cpu, "job"),
            JobKind::Cpu,
            token.clone(),
            vec![(dep, JobOutput::new(3u64))],
            None,
            None,
        );

        assert_eq!(*ctx.dependency::<u64>(&dep).unwrap(), 3);
        assert!(ctx.checkpoint().is_ok());
        assert!(ctx.require_framework_context().is_err());
        token.cancel();
        assert_eq!(ctx.checkpoint(), Err(JobError::Canceled));
    }
}
