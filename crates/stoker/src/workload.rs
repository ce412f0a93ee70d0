//! Workload files
//!
//! A workload is a TOML (or YAML) file listing shell jobs:
//!
//! ```toml
//! [[job]]
//! name = "fetch"
//! kind = "web_read"
//! command = "curl -s https://example.com/data.json"
//!
//! [[job]]
//! name = "summarize"
//! command = "echo \"$STOKER_DEP_FETCH\" | wc -c"
//! depends_on = ["fetch"]
//! cache_to_disk = true
//! ```
//!
//! Each job's stdout becomes its result. Dependents see their dependencies'
//! results in `STOKER_DEP_<NAME>` environment variables.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stoker_engine::{
    Fingerprint, GraphError, JobContext, JobDefinition, JobError, JobGraph, JobKind, JobSpec,
};

/// Exit status a command uses to report a failure worth retrying (EX_TEMPFAIL)
pub const TRANSIENT_EXIT_CODE: i32 = 75;

/// How often a running command is checked for exit or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Example workload written by `stoker init --workload`
pub const WORKLOAD_TEMPLATE: &str = r#"# Stoker workload
#
# kind is one of: cpu, web_read, web_write, disk
# Exit with status 75 to report a transient failure.

[[job]]
name = "inputs"
kind = "disk"
command = "ls -1"

[[job]]
name = "count"
command = "echo \"$STOKER_DEP_INPUTS\" | wc -l"
depends_on = ["inputs"]
cache_to_disk = true
"#;

/// Errors loading or interpreting a workload
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("Failed to read workload {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid workload TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid workload YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Workload contains no jobs")]
    Empty,

    #[error("Job '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Failed to fingerprint job '{name}': {source}")]
    Fingerprint {
        name: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A parsed workload file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default, rename = "job")]
    pub jobs: Vec<WorkloadJob>,
}

/// One shell job in a workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadJob {
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: JobKind,

    pub command: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Persist the result in the disk cache and reuse it across runs
    #[serde(default)]
    pub cache_to_disk: bool,
}

fn default_kind() -> JobKind {
    JobKind::Cpu
}

impl Workload {
    /// Load a workload, choosing the format by extension
    pub fn load(path: &Path) -> Result<Self, WorkloadError> {
        let content = std::fs::read_to_string(path).map_err(|source| WorkloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let workload: Workload = if path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            serde_yaml::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        workload.validate()?;
        info!(path = %path.display(), jobs = workload.jobs.len(), "workload loaded");
        Ok(workload)
    }

    fn validate(&self) -> Result<(), WorkloadError> {
        if self.jobs.is_empty() {
            return Err(WorkloadError::Empty);
        }
        if let Some(job) = self.jobs.iter().find(|job| job.command.trim().is_empty()) {
            return Err(WorkloadError::EmptyCommand(job.name.clone()));
        }
        Ok(())
    }

    /// Fingerprint every job over its kind, command and its dependencies'
    /// fingerprints, so changing an upstream command invalidates everything
    /// downstream of it.
    pub fn fingerprints(&self) -> Result<HashMap<String, Fingerprint>, WorkloadError> {
        let mut resolved: HashMap<String, Fingerprint> = HashMap::new();

        loop {
            let mut progressed = false;
            for job in &self.jobs {
                if resolved.contains_key(&job.name) {
                    continue;
                }
                let deps: Option<Vec<String>> = job
                    .depends_on
                    .iter()
                    .map(|dep| resolved.get(dep).map(Fingerprint::to_string))
                    .collect();
                let Some(deps) = deps else {
                    continue;
                };
                let fingerprint = fingerprint_job(job, &deps)?;
                resolved.insert(job.name.clone(), fingerprint);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        // Jobs in a cycle or with an unknown dependency; graph construction rejects them
        for job in &self.jobs {
            if !resolved.contains_key(&job.name) {
                let fingerprint = fingerprint_job(job, &job.depends_on)?;
                resolved.insert(job.name.clone(), fingerprint);
            }
        }

        Ok(resolved)
    }

    /// Turn the workload into a job graph whose commands run in `root`
    pub fn into_graph(self, root: &Path) -> Result<JobGraph, WorkloadError> {
        let fingerprints = self.fingerprints()?;

        let specs = self
            .jobs
            .into_iter()
            .map(|job| {
                let fingerprint = fingerprints[&job.name];
                let inputs: Vec<(String, Fingerprint)> = job
                    .depends_on
                    .iter()
                    .filter_map(|dep| fingerprints.get(dep).map(|fp| (dep.clone(), *fp)))
                    .collect();
                let command = ShellCommand {
                    command: job.command,
                    root: root.to_path_buf(),
                    inputs,
                };

                let definition = if job.cache_to_disk {
                    JobDefinition::cacheable(job.kind, fingerprint, move |ctx| command.run(ctx))
                } else {
                    JobDefinition::new(job.kind, fingerprint, move |ctx| command.run(ctx))
                };

                job.depends_on.into_iter().fold(
                    JobSpec::new(job.name.clone(), definition.with_label(job.name)),
                    JobSpec::after,
                )
            })
            .collect();

        Ok(JobGraph::build(specs)?)
    }
}

fn fingerprint_job(job: &WorkloadJob, deps: &[String]) -> Result<Fingerprint, WorkloadError> {
    Fingerprint::of(job.kind, &(&job.command, deps)).map_err(|source| WorkloadError::Fingerprint {
        name: job.name.clone(),
        source,
    })
}

/// Environment variable carrying a dependency's output
pub fn dependency_env_var(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("STOKER_DEP_{}", sanitized)
}

/// A shell command bound to its working directory and dependency inputs
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub command: String,
    pub root: PathBuf,
    pub inputs: Vec<(String, Fingerprint)>,
}

impl ShellCommand {
    /// Run under `sh -c`, returning stdout.
    ///
    /// The child is killed as soon as the job is canceled.
    pub fn run(&self, ctx: &JobContext) -> Result<String, JobError> {
        let mut env = Vec::with_capacity(self.inputs.len());
        for (name, fingerprint) in &self.inputs {
            let value = ctx
                .dependency::<String>(fingerprint)
                .ok_or_else(|| JobError::permanent(format!("missing output of '{}'", name)))?;
            env.push((dependency_env_var(name), value.as_str().to_owned()));
        }

        debug!(command = %self.command, "spawning");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.root)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| JobError::permanent(format!("failed to spawn '{}': {}", self.command, e)))?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = wait_cancellable(&mut child, ctx)?;
        let stdout = collect("stdout", stdout)?;
        let stderr = String::from_utf8_lossy(&collect("stderr", stderr)?).into_owned();

        match status.code() {
            Some(0) => String::from_utf8(stdout).map_err(|e| {
                JobError::permanent(format!(
                    "stdout is not valid UTF-8 (invalid byte at offset {})",
                    e.utf8_error().valid_up_to()
                ))
            }),
            Some(TRANSIENT_EXIT_CODE) => Err(JobError::transient(failure_message(
                TRANSIENT_EXIT_CODE,
                &stderr,
            ))),
            Some(code) => Err(JobError::permanent(failure_message(code, &stderr))),
            None => Err(JobError::permanent("terminated by signal")),
        }
    }
}

fn wait_cancellable(child: &mut Child, ctx: &JobContext) -> Result<ExitStatus, JobError> {
    loop {
        if ctx.is_canceled() {
            warn!("job canceled, killing child process");
            let _ = child.kill();
            let _ = child.wait();
            return Err(JobError::Canceled);
        }
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(JobError::permanent(format!("failed to wait on child: {}", e))),
        }
    }
}

/// Read a pipe to the end on its own thread so the child never blocks on it
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(
    stream: &str,
    handle: Option<JoinHandle<io::Result<Vec<u8>>>>,
) -> Result<Vec<u8>, JobError> {
    let Some(handle) = handle else {
        return Ok(Vec::new());
    };
    match handle.join() {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(JobError::permanent(format!("failed to read {}: {}", stream, e))),
        Err(_) => Err(JobError::permanent(format!("{} reader panicked", stream))),
    }
}

fn failure_message(code: i32, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with status {}", code)
    } else {
        format!("exited with status {}: {}", code, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoker_core::Config;
    use stoker_engine::{Engine, JobReporterRegistry, JobState};
    use tempfile::TempDir;

    fn parse(toml: &str) -> Workload {
        toml::from_str(toml).unwrap()
    }

    fn engine() -> Engine {
        let mut config = Config::default();
        config.engine.cpu_threads = Some(2);
        Engine::builder(config)
            .with_reporters(JobReporterRegistry::empty())
            .build()
            .unwrap()
    }

    #[test]
    fn test_template_parses() {
        let workload = parse(WORKLOAD_TEMPLATE);
        workload.validate().unwrap();
        assert_eq!(workload.jobs.len(), 2);
        assert_eq!(workload.jobs[0].kind, JobKind::Disk);
        assert_eq!(workload.jobs[1].kind, JobKind::Cpu);
        assert!(workload.jobs[1].cache_to_disk);
    }

    #[test]
    fn test_load_yaml_and_reject_empty() {
        let temp = TempDir::new().unwrap();
        let yaml = temp.path().join("work.yaml");
        std::fs::write(
            &yaml,
            "job:\n  - name: a\n    command: echo a\n    kind: web_read\n",
        )
        .unwrap();
        let workload = Workload::load(&yaml).unwrap();
        assert_eq!(workload.jobs[0].kind, JobKind::WebRead);

        let empty = temp.path().join("empty.toml");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(Workload::load(&empty), Err(WorkloadError::Empty)));
    }

    #[test]
    fn test_upstream_change_changes_downstream_fingerprint() {
        let before = parse(
            r#"
            [[job]]
            name = "a"
            command = "echo 1"
            [[job]]
            name = "b"
            command = "cat"
            depends_on = ["a"]
            "#,
        );
        let mut after = before.clone();
        after.jobs[0].command = "echo 2".to_string();

        let before = before.fingerprints().unwrap();
        let after = after.fingerprints().unwrap();
        assert_ne!(before["a"], after["a"]);
        assert_ne!(before["b"], after["b"]);
    }

    #[test]
    fn test_cycle_reported_by_graph() {
        let workload = parse(
            r#"
            [[job]]
            name = "a"
            command = "true"
            depends_on = ["b"]
            [[job]]
            name = "b"
            command = "true"
            depends_on = ["a"]
            "#,
        );
        let result = workload.into_graph(Path::new("."));
        assert!(matches!(
            result,
            Err(WorkloadError::Graph(GraphError::CyclicDependency(_)))
        ));
    }

    #[test]
    fn test_dependency_env_var() {
        assert_eq!(dependency_env_var("fetch-data.v2"), "STOKER_DEP_FETCH_DATA_V2");
    }

    #[tokio::test]
    async fn test_outputs_flow_between_commands() {
        let temp = TempDir::new().unwrap();
        let workload = parse(
            r#"
            [[job]]
            name = "greet"
            command = "printf hello"
            [[job]]
            name = "shout"
            command = "printf '%s!' \"$STOKER_DEP_GREET\" | tr a-z A-Z"
            depends_on = ["greet"]
            "#,
        );
        let graph = workload.into_graph(temp.path()).unwrap();

        let engine = engine();
        let handles = engine.submit_graph(graph);
        let shout = &handles["shout"];
        assert_eq!(shout.wait().await, JobState::Succeeded);
        assert_eq!(shout.result::<String>().unwrap().as_str(), "HELLO!");
    }

    #[tokio::test]
    async fn test_exit_codes_classify_failures() {
        let temp = TempDir::new().unwrap();
        let workload = parse(
            r#"
            [[job]]
            name = "flaky"
            command = "echo busy >&2; exit 75"
            [[job]]
            name = "broken"
            command = "exit 3"
            "#,
        );
        let engine = engine();
        let handles = engine.submit_graph(workload.into_graph(temp.path()).unwrap());

        assert_eq!(handles["flaky"].wait().await, JobState::FailedTransient);
        assert_eq!(handles["broken"].wait().await, JobState::FailedPermanent);

        let failures = engine.get_permanent_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "exited with status 3");
    }

    #[tokio::test]
    async fn test_non_utf8_output_fails_permanently() {
        let temp = TempDir::new().unwrap();
        let workload = parse(
            r#"
            [[job]]
            name = "binary"
            command = "printf 'ab\\377cd'"
            cache_to_disk = true
            "#,
        );
        let engine = engine();
        let handles = engine.submit_graph(workload.into_graph(temp.path()).unwrap());

        assert_eq!(handles["binary"].wait().await, JobState::FailedPermanent);
        assert!(handles["binary"].result::<String>().is_none());

        let failures = engine.get_permanent_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].message,
            "stdout is not valid UTF-8 (invalid byte at offset 2)"
        );
    }

    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        let temp = TempDir::new().unwrap();
        let fingerprint = Fingerprint::new(JobKind::Cpu, "sleep");
        let command = ShellCommand {
            command: "sleep 30".to_string(),
            root: temp.path().to_path_buf(),
            inputs: Vec::new(),
        };

        let engine = engine();
        let handle = engine.submit(JobDefinition::new(JobKind::Cpu, fingerprint, move |ctx| {
            command.run(ctx)
        }));
        while handle.state() != JobState::Executing {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = std::time::Instant::now();
        assert!(engine.cancel_job(&fingerprint));
        assert_eq!(handle.wait().await, JobState::Canceled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
