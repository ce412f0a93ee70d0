//! Job execution reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::job::{Fingerprint, JobKind};

/// Where a completed job's result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Executed,
    MemoryCache,
    DiskCache,
}

/// Events emitted as jobs move through the engine
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job was accepted (not emitted for deduplicated submissions)
    Submitted {
        fingerprint: Fingerprint,
        kind: JobKind,
        label: String,
    },
    /// A worker claimed the job
    Started {
        fingerprint: Fingerprint,
        kind: JobKind,
        label: String,
    },
    /// The job's result is readable
    Completed {
        fingerprint: Fingerprint,
        label: String,
        source: ResultSource,
        duration: Duration,
    },
    /// The job's closure failed
    Failed {
        fingerprint: Fingerprint,
        label: String,
        transient: bool,
        error: String,
        duration: Duration,
    },
    /// The job was canceled before or during execution
    Canceled {
        fingerprint: Fingerprint,
        label: String,
    },
    /// A dependency failed, so the job never ran
    DependencyFailed {
        fingerprint: Fingerprint,
        label: String,
        dependency: Fingerprint,
        transient: bool,
    },
}

/// Receives job lifecycle events. Called on worker threads.
pub trait JobReporter: Send + Sync {
    fn report(&self, event: &JobEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl JobReporter for TracingReporter {
    fn report(&self, event: &JobEvent) {
        match event {
            JobEvent::Submitted {
                fingerprint,
                kind,
                label,
            } => {
                tracing::debug!(fingerprint = %fingerprint.short(), kind = %kind, "submitted {}", label);
            }
            JobEvent::Started {
                fingerprint,
                kind,
                label,
            } => {
                tracing::debug!(fingerprint = %fingerprint.short(), kind = %kind, "starting {}", label);
            }
            JobEvent::Completed {
                fingerprint,
                label,
                source,
                duration,
            } => match source {
                ResultSource::Executed => tracing::info!(
                    fingerprint = %fingerprint.short(),
                    "{} completed in {:.2}s",
                    label,
                    duration.as_secs_f64()
                ),
                ResultSource::MemoryCache | ResultSource::DiskCache => tracing::info!(
                    fingerprint = %fingerprint.short(),
                    source = ?source,
                    "{} completed (cached)",
                    label
                ),
            },
            JobEvent::Failed {
                fingerprint,
                label,
                transient,
                error,
                duration,
            } => {
                if *transient {
                    tracing::warn!(
                        fingerprint = %fingerprint.short(),
                        "{} failed transiently after {:.2}s: {}",
                        label,
                        duration.as_secs_f64(),
                        error
                    );
                } else {
                    tracing::error!(
                        fingerprint = %fingerprint.short(),
                        "{} failed after {:.2}s: {}",
                        label,
                        duration.as_secs_f64(),
                        error
                    );
                }
            }
            JobEvent::Canceled { fingerprint, label } => {
                tracing::info!(fingerprint = %fingerprint.short(), "{} canceled", label);
            }
            JobEvent::DependencyFailed {
                fingerprint,
                label,
                dependency,
                transient,
            } => {
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    dependency = %dependency.short(),
                    transient,
                    "{} not run: dependency failed",
                    label
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<JobEvent>>,
}

impl CollectingReporter {
    /// All collected events
    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl JobReporter for CollectingReporter {
    fn report(&self, event: &JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registry of job reporters
#[derive(Clone)]
pub struct JobReporterRegistry {
    reporters: Vec<Arc<dyn JobReporter>>,
}

impl JobReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: JobReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Register a reporter the caller keeps a handle to
    pub fn register_shared(&mut self, reporter: Arc<dyn JobReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn JobReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &JobEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for JobReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint::new(JobKind::Cpu, "dose")
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        reporter.report(&JobEvent::Started {
            fingerprint: fp(),
            kind: JobKind::Cpu,
            label: "dose".to_string(),
        });
        reporter.report(&JobEvent::Completed {
            fingerprint: fp(),
            label: "dose".to_string(),
            source: ResultSource::Executed,
            duration: Duration::from_millis(5),
        });

        assert_eq!(reporter.events().len(), 2);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;

        // Just verify it doesn't panic
        reporter.report(&JobEvent::Failed {
            fingerprint: fp(),
            label: "dose".to_string(),
            transient: true,
            error: "timeout".to_string(),
            duration: Duration::from_secs(1),
        });
        reporter.report(&JobEvent::DependencyFailed {
            fingerprint: fp(),
            label: "dose".to_string(),
            dependency: Fingerprint::new(JobKind::Disk, "volume"),
            transient: false,
        });
    }

    #[test]
    fn test_broadcast() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = JobReporterRegistry::empty();
        registry.register_shared(collecting.clone());

        registry.broadcast(&JobEvent::Canceled {
            fingerprint: fp(),
            label: "dose".to_string(),
        });

        assert_eq!(collecting.events().len(), 1);
    }

    #[test]
    fn test_register() {
        let mut registry = JobReporterRegistry::empty();
        assert!(registry.all().is_empty());

        registry.register(TracingReporter);
        registry.register(CollectingReporter::default());
        assert_eq!(registry.all().len(), 2);
        assert_eq!(JobReporterRegistry::new().all().len(), 1);
    }
}
