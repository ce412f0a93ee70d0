//! Init command

use std::path::{Path, PathBuf};

use clap::Args;
use console::style;
use dialoguer::Confirm;
use tracing::info;

use stoker_core::config::{default_config_toml, DEFAULT_CONFIG_TOML};

use crate::cli::output::{self, path_style};
use crate::cli::Cli;
use crate::workload::WORKLOAD_TEMPLATE;

/// Write a default Stoker configuration
#[derive(Debug, Args)]
pub struct InitCommand {
    /// Force overwrite existing files
    #[arg(short, long)]
    pub force: bool,

    /// Fail instead of prompting when a file exists
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Output file path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Also write an example workload to this path
    #[arg(long)]
    pub workload: Option<PathBuf>,
}

impl InitCommand {
    /// Execute the init command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(force = self.force, yes = self.yes, "executing init command");
        let cwd = std::env::current_dir()?;
        let config_path = self
            .output
            .clone()
            .unwrap_or_else(|| cwd.join(DEFAULT_CONFIG_TOML));

        if !self.write_file(&config_path, &default_config_toml()?)? {
            return Ok(());
        }
        if !cli.quiet {
            output::success(&format!(
                "Created configuration at {}",
                path_style().apply_to(config_path.display())
            ));
        }

        if let Some(workload) = &self.workload {
            if self.write_file(workload, WORKLOAD_TEMPLATE)? && !cli.quiet {
                output::success(&format!(
                    "Created example workload at {}",
                    path_style().apply_to(workload.display())
                ));
            }
        }

        if !cli.quiet {
            let workload = self
                .workload
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "workload.toml".to_string());
            println!();
            println!("Next steps:");
            println!("  1. Edit {} to size the worker pools and caches", config_path.display());
            println!(
                "  2. Run {} to preview the plan",
                style(format!("stoker run {} --dry-run", workload)).cyan()
            );
            println!("  3. Run {} to execute it", style(format!("stoker run {}", workload)).cyan());
        }

        Ok(())
    }

    /// Write `content` unless the file exists and overwriting is declined.
    /// Returns whether the file was written.
    fn write_file(&self, path: &Path, content: &str) -> anyhow::Result<bool> {
        if path.exists() && !self.force {
            if self.yes {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    path.display()
                );
            }

            let overwrite = Confirm::new()
                .with_prompt(format!("{} already exists. Overwrite?", path.display()))
                .default(false)
                .interact()?;

            if !overwrite {
                println!("{}", style("Aborted.").yellow());
                return Ok(false);
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn quiet_cli() -> Cli {
        Cli::try_parse_from(["stoker", "--quiet", "init"]).unwrap()
    }

    #[test]
    fn test_writes_config_and_workload() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("stoker.toml");
        let workload = temp.path().join("jobs").join("workload.toml");
        let command = InitCommand {
            force: false,
            yes: true,
            output: Some(config.clone()),
            workload: Some(workload.clone()),
        };

        command.execute(&quiet_cli()).unwrap();

        let parsed: stoker_core::Config =
            toml::from_str(&std::fs::read_to_string(&config).unwrap()).unwrap();
        assert_eq!(parsed.engine.web_max_threads, 64);
        assert!(std::fs::read_to_string(&workload)
            .unwrap()
            .contains("[[job]]"));
    }

    #[test]
    fn test_existing_file_requires_force() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("stoker.toml");
        std::fs::write(&config, "# mine").unwrap();

        let command = InitCommand {
            force: false,
            yes: true,
            output: Some(config.clone()),
            workload: None,
        };
        assert!(command.execute(&quiet_cli()).is_err());
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "# mine");

        let forced = InitCommand {
            force: true,
            ..command
        };
        forced.execute(&quiet_cli()).unwrap();
        assert!(std::fs::read_to_string(&config)
            .unwrap()
            .starts_with("# Stoker configuration"));
    }
}
