//! Cache management command

use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;
use tracing::info;

use stoker_core::config::load_config_or_default;
use stoker_engine::{DiskCacheStats, FileDiskCache};

use crate::cli::output::{self, path_style};
use crate::cli::{Cli, OutputFormat};

/// Persistent result cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove old cache entries
    Prune(CachePruneCommand),
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// Clear all cached entries
    Clean(CacheCleanCommand),
}

/// Prune old cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum age in days
    #[arg(long, default_value = "7")]
    pub max_age_days: u64,
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Clear all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd);
        let cache = FileDiskCache::from_config(&cwd, &config.cache);

        match &self.action {
            CacheAction::Prune(cmd) => cmd.execute(cli, &cache),
            CacheAction::Status(cmd) => cmd.execute(cli, &cache),
            CacheAction::Clean(cmd) => cmd.execute(cli, &cache),
        }
    }
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli, cache: &FileDiskCache) -> anyhow::Result<()> {
        let max_age = Duration::from_secs(self.max_age_days * 24 * 60 * 60);
        info!(max_age_days = self.max_age_days, "pruning disk cache");

        if cli.prints_text() {
            output::info(&format!(
                "Pruning cache entries older than {} days...",
                self.max_age_days
            ));
        }

        let stats = cache.prune(max_age)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            output::success(&format!(
                "Removed {} of {} entries ({} kept)",
                stats.removed, stats.total, stats.kept
            ));
        }

        Ok(())
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli, cache: &FileDiskCache) -> anyhow::Result<()> {
        let stats = cache.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "max_size": stats.max_size,
                "cache_dir": cache.cache_dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            print_status(cache, &stats);

            if cli.verbose {
                let mut entries = cache.entries()?;
                entries.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
                println!();
                for (_, meta) in entries {
                    println!(
                        "  {} {} {} {}",
                        style(meta.fingerprint.get(..12).unwrap_or(meta.fingerprint.as_str())).dim(),
                        meta.type_name,
                        style(format!("{}B", meta.size_bytes)).yellow(),
                        style(meta.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
                    );
                }
            }
        }

        Ok(())
    }
}

fn print_status(cache: &FileDiskCache, stats: &DiskCacheStats) {
    println!("{}", output::header("Disk Cache Status"));
    println!();
    println!(
        "{}",
        output::key_value(
            "Location",
            &path_style().apply_to(cache.cache_dir().display()).to_string()
        )
    );
    println!("{}", output::key_value("Entries", &stats.entries.to_string()));
    println!(
        "{}",
        output::key_value(
            "Size",
            &format!(
                "{} (max {} MB)",
                style(stats.formatted_size()).yellow(),
                stats.max_size / (1024 * 1024)
            )
        )
    );
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli, cache: &FileDiskCache) -> anyhow::Result<()> {
        let cache_dir = cache.cache_dir().to_path_buf();

        if !cache_dir.exists() {
            if !cli.quiet {
                output::success("Cache directory does not exist.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all cached entries at {}?",
                    cache_dir.display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let removed = cache.clean()?;

        if cli.format == OutputFormat::Json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "removed": removed }))?
            );
        } else if !cli.quiet {
            output::success(&format!(
                "Removed {} cached {} from {}",
                removed,
                if removed == 1 { "entry" } else { "entries" },
                path_style().apply_to(cache_dir.display())
            ));
        }

        Ok(())
    }
}
