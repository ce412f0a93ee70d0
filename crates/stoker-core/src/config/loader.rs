//! Configuration discovery and loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result, StokerError};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// On-disk configuration syntax, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// `.toml` files are TOML, everything else is read as YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }

    fn parse(self, content: &str) -> std::result::Result<Config, ConfigError> {
        Ok(match self {
            Self::Toml => toml::from_str(content)?,
            Self::Yaml => serde_yaml::from_str(content)?,
        })
    }
}

/// Read, parse and validate one configuration file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = ConfigFormat::from_path(path);
    debug!(path = %path.display(), ?format, "reading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config = format.parse(&content)?;
    validate_config(&config)?;

    info!(
        path = %path.display(),
        cpu_threads = config.engine.effective_cpu_threads(),
        disk_threads = config.engine.disk_threads,
        web_max_threads = config.engine.web_max_threads,
        "config loaded"
    );
    Ok(config)
}

/// Find the nearest configuration file, starting at `start_dir` and walking
/// up to the filesystem root. At each level the first existing name from
/// [`config_file_names`] wins.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let found = start_dir.ancestors().find_map(|dir| {
        config_file_names()
            .into_iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    });
    match &found {
        Some(path) => debug!(path = %path.display(), "found config file"),
        None => debug!(start_dir = %start_dir.display(), "no config file found"),
    }
    found
}

/// Load the nearest configuration for `dir`
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;
    let config = load_config(&path)?;
    Ok((config, path))
}

/// Load the nearest configuration, falling back to defaults.
///
/// A file that exists but cannot be used is reported and ignored.
pub fn load_config_or_default(dir: &Path) -> (Config, Option<PathBuf>) {
    match load_config_from_dir(dir) {
        Ok((config, path)) => (config, Some(path)),
        Err(StokerError::Config(ConfigError::NotFound(_))) => {
            debug!(dir = %dir.display(), "using default config");
            (Config::default(), None)
        }
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "ignoring unusable config, using defaults");
            (Config::default(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("stoker.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new(".stoker.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("stoker")), ConfigFormat::Yaml);
    }

    #[test]
    fn test_directory_named_like_config_is_skipped() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("stoker.toml")).unwrap();
        let yaml_path = temp.path().join("stoker.yaml");
        std::fs::write(&yaml_path, "engine:\n  disk_threads: 4").unwrap();

        assert_eq!(find_config(temp.path()), Some(yaml_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("stoker.toml");
        let yaml_path = temp.path().join("stoker.yaml");
        std::fs::write(&toml_path, "[engine]\ndisk_threads = 3").unwrap();
        std::fs::write(&yaml_path, "engine:\n  disk_threads: 4").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let config_path = temp.path().join(".stoker.toml");
        std::fs::write(&config_path, "").unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("stoker.toml");
        std::fs::write(
            &config_path,
            "[engine]\ncpu_threads = 2\ndisk_threads = 1\n\n[cache]\nmemory_limit_mb = 64\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.engine.cpu_threads, Some(2));
        assert_eq!(config.engine.disk_threads, 1);
        assert_eq!(config.cache.memory_limit_mb, Some(64));
        assert_eq!(config.engine.web_max_threads, 64);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("stoker.yaml");
        std::fs::write(
            &config_path,
            "remote:\n  api_url: https://calc.example.com\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(
            config.remote.api_url.as_deref(),
            Some("https://calc.example.com")
        );
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("stoker.toml");
        std::fs::write(&config_path, "[engine]\ndisk_threads = 0\n").unwrap();

        assert!(load_config(&config_path).is_err());
    }

    #[test]
    fn test_load_config_or_default_ignores_broken_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("stoker.toml"), "[engine\n").unwrap();

        let (config, path) = load_config_or_default(temp.path());
        assert!(path.is_none());
        assert_eq!(config.engine.web_max_threads, 64);
    }

    #[test]
    fn test_load_config_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path());
        assert!(path.is_none());
        assert_eq!(config.engine.disk_threads, 2);
    }
}
