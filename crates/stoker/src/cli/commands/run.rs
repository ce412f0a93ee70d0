//! Run command: execute a workload on the engine

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Args;
use console::style;
use serde::Serialize;
use tracing::{debug, info};

use stoker_core::config::load_config_or_default;
use stoker_engine::{
    CollectingReporter, Engine, EngineStatus, FileDiskCache, Fingerprint, GraphNode, JobEvent,
    JobHandle, JobKind, JobReporter, JobReporterRegistry, JobState, ResultSource,
};

use crate::cli::output::{self, plural};
use crate::cli::{Cli, OutputFormat};
use crate::workload::Workload;

/// Run the jobs of a workload file
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Workload file (TOML or YAML)
    pub workload: PathBuf,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,

    /// Neither read nor write the persistent cache
    #[arg(long)]
    pub no_cache: bool,

    /// Number of CPU worker threads
    #[arg(long)]
    pub cpu_threads: Option<usize>,

    /// Evict unreferenced results once the memory cache exceeds this size
    #[arg(long)]
    pub memory_limit_mb: Option<u64>,
}

/// Returned when a run finishes with jobs that did not succeed
#[derive(Debug, thiserror::Error)]
#[error("{failed} job(s) did not succeed")]
pub struct JobsFailed {
    pub failed: usize,
    pub interrupted: bool,
}

/// Outcome of one workload job
#[derive(Debug, Serialize)]
struct JobRow {
    name: String,
    fingerprint: String,
    kind: JobKind,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<ResultSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let (mut config, config_path) = load_config_or_default(&cwd);
        if let Some(path) = &config_path {
            debug!(path = %path.display(), "using config");
        }
        if let Some(threads) = self.cpu_threads {
            config.engine.cpu_threads = Some(threads);
        }
        if let Some(limit) = self.memory_limit_mb {
            config.cache.memory_limit_mb = Some(limit);
        }

        let workload_path = cwd.join(&self.workload);
        let root = workload_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.clone());
        let graph = Workload::load(&workload_path)?.into_graph(&root)?;
        let nodes: Vec<GraphNode> = graph
            .sorted()
            .iter()
            .filter_map(|name| graph.get(name).cloned())
            .collect();

        if cli.prints_text() {
            println!();
            output::info(&format!(
                "{} in {}",
                plural(graph.len(), "job"),
                plural(graph.waves().len(), "wave")
            ));

            if cli.verbose || self.dry_run {
                println!();
                print!("{}", graph.execution_plan());
            }

            if self.dry_run {
                println!();
                println!("{}", style("[DRY RUN - no jobs will be executed]").yellow().bold());
                return Ok(());
            }

            println!();
        }

        if self.dry_run {
            if cli.format == OutputFormat::Json {
                let plan: Vec<serde_json::Value> = graph
                    .waves()
                    .iter()
                    .enumerate()
                    .map(|(i, wave)| {
                        serde_json::json!({
                            "wave": i,
                            "jobs": wave
                                .iter()
                                .filter_map(|name| graph.get(name))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
            return Ok(());
        }

        let disk_cache = (!self.no_cache)
            .then(|| Arc::new(FileDiskCache::from_config(&cwd, &config.cache)));

        let collector = Arc::new(CollectingReporter::default());
        let mut reporters = JobReporterRegistry::new();
        reporters.register_shared(collector.clone());
        if cli.prints_text() {
            reporters.register(ConsoleReporter::new(cli.verbose));
        }

        let mut builder = Engine::builder(config).with_reporters(reporters);
        if let Some(cache) = disk_cache {
            builder = builder.with_disk_cache(cache);
        }
        let engine = builder.build()?;

        let started = Instant::now();
        let handles = engine.submit_graph(graph);
        info!(jobs = handles.len(), "workload submitted");

        let interrupted = tokio::select! {
            _ = wait_all(&handles) => false,
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            if cli.prints_text() {
                output::warning("Interrupted, canceling jobs...");
            }
            engine.clear_all_jobs();
        }
        let elapsed = started.elapsed();

        let rows = collect_rows(&nodes, &handles, &collector.events());
        let mut status = EngineStatus::default();
        engine.update_status(&mut status);
        let permanent = engine.get_permanent_failures();

        let succeeded = rows.iter().filter(|r| r.state == JobState::Succeeded).count();
        let failed = rows.len() - succeeded;
        let cached = rows
            .iter()
            .filter(|r| {
                matches!(
                    r.source,
                    Some(ResultSource::MemoryCache | ResultSource::DiskCache)
                )
            })
            .count();

        if cli.format == OutputFormat::Json {
            let summary = serde_json::json!({
                "total": rows.len(),
                "succeeded": succeeded,
                "failed": failed,
                "cached": cached,
                "interrupted": interrupted,
                "duration_ms": elapsed.as_millis(),
                "jobs": rows,
                "queues": status.queues,
                "failures": {
                    "transient": status.transient_failures,
                    "permanent": permanent,
                },
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else if !cli.quiet {
            println!();
            println!(
                "  {} {}/{} succeeded, {} failed, {} cached ({:.1}s)",
                if failed == 0 {
                    style("✓").green().bold()
                } else {
                    style("✗").red().bold()
                },
                succeeded,
                rows.len(),
                failed,
                cached,
                elapsed.as_secs_f64()
            );

            if cli.verbose {
                print_outputs(&rows);
                print_queues(&status);
            }

            if failed > 0 {
                println!();
                println!("  {} {}:", style("✗").red().bold(), plural(failed, "job"));
                for row in rows.iter().filter(|r| r.state != JobState::Succeeded) {
                    println!(
                        "    {} {} [{}]{}",
                        style("✗").red(),
                        row.name,
                        output::job_state(row.state),
                        row.error
                            .as_deref()
                            .map(|e| format!(": {}", e))
                            .unwrap_or_default()
                    );
                }
            }
        }

        if failed > 0 {
            return Err(JobsFailed {
                failed,
                interrupted,
            }
            .into());
        }

        Ok(())
    }
}

async fn wait_all(handles: &HashMap<String, JobHandle>) {
    for handle in handles.values() {
        handle.wait().await;
    }
}

/// Join graph nodes, handles and reported events into one row per job
fn collect_rows(
    nodes: &[GraphNode],
    handles: &HashMap<String, JobHandle>,
    events: &[JobEvent],
) -> Vec<JobRow> {
    let names: HashMap<Fingerprint, &str> = nodes
        .iter()
        .map(|node| (node.fingerprint, node.name.as_str()))
        .collect();

    let mut sources: HashMap<Fingerprint, ResultSource> = HashMap::new();
    let mut errors: HashMap<Fingerprint, String> = HashMap::new();
    for event in events {
        match event {
            JobEvent::Completed {
                fingerprint, source, ..
            } => {
                sources.insert(*fingerprint, *source);
            }
            JobEvent::Failed {
                fingerprint, error, ..
            } => {
                errors.insert(*fingerprint, error.clone());
            }
            JobEvent::DependencyFailed {
                fingerprint,
                dependency,
                ..
            } => {
                let dependency = names
                    .get(dependency)
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| dependency.short());
                errors.insert(*fingerprint, format!("dependency '{}' failed", dependency));
            }
            _ => {}
        }
    }

    nodes
        .iter()
        .filter_map(|node| {
            let handle = handles.get(&node.name)?;
            let state = handle.state();
            // handles resolved from the memory cache emit no Completed event
            let source = sources
                .get(&node.fingerprint)
                .copied()
                .or((state == JobState::Succeeded).then_some(ResultSource::MemoryCache));
            Some(JobRow {
                name: node.name.clone(),
                fingerprint: node.fingerprint.to_string(),
                kind: node.kind,
                state,
                source,
                output: handle.result::<String>().map(|out| out.as_str().to_owned()),
                error: errors.get(&node.fingerprint).cloned(),
            })
        })
        .collect()
}

fn print_outputs(rows: &[JobRow]) {
    for row in rows {
        let Some(out) = row.output.as_deref() else {
            continue;
        };
        if out.trim().is_empty() {
            continue;
        }
        println!();
        println!("  {}", output::header(&row.name));
        for line in out.lines() {
            println!("    {}", line);
        }
    }
}

fn print_queues(status: &EngineStatus) {
    println!();
    println!("  {}", output::header("Queues"));
    for (kind, queue) in &status.queues {
        println!(
            "{}",
            output::key_value(
                kind.as_str(),
                &format!(
                    "{} queued, {} threads ({} idle)",
                    queue.queued_jobs, queue.total_threads, queue.idle_threads
                )
            )
        );
    }
}

/// Console reporter with live progress lines
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl JobReporter for ConsoleReporter {
    fn report(&self, event: &JobEvent) {
        match event {
            JobEvent::Submitted { .. } => {}
            JobEvent::Started { label, kind, .. } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(label).bold(),
                    if self.verbose {
                        style(format!("({})", kind)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            JobEvent::Completed {
                label,
                source,
                duration,
                ..
            } => {
                let origin = match source {
                    ResultSource::Executed => String::new(),
                    ResultSource::MemoryCache => style("(cached)").cyan().to_string(),
                    ResultSource::DiskCache => style("(disk cache)").cyan().to_string(),
                };
                println!(
                    "  {} {} {} {}",
                    style("✓").green(),
                    style(label).green(),
                    origin,
                    style(format!("{:.1}s", duration.as_secs_f64())).dim()
                );
            }
            JobEvent::Failed {
                label,
                transient,
                error,
                duration,
                ..
            } => {
                println!(
                    "  {} {} {}{} {}",
                    style("✗").red(),
                    style(label).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    if *transient {
                        style(" (transient)").yellow().to_string()
                    } else {
                        String::new()
                    },
                    style(error).red().dim()
                );
            }
            JobEvent::Canceled { label, .. } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(label).yellow(),
                    style("(canceled)").dim()
                );
            }
            JobEvent::DependencyFailed { label, .. } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(label).yellow(),
                    style("(dependency failed)").dim()
                );
            }
        }
    }
}
