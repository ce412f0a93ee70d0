//! Default configuration values

use crate::error::ConfigError;

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "stoker.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "stoker.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".stoker.toml",
        ".stoker.yaml",
    ]
}

/// Render the default configuration as TOML
pub fn default_config_toml() -> Result<String, ConfigError> {
    let body = toml::to_string_pretty(&Config::default())?;
    Ok(format!("# Stoker configuration\n\n{}", body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_toml_round_trips() {
        let rendered = default_config_toml().unwrap();
        assert!(rendered.starts_with("# Stoker configuration"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.engine.disk_threads, 2);
        assert_eq!(parsed.cache.disk_max_size_mb, 1024);
    }

    #[test]
    fn test_toml_listed_first() {
        assert_eq!(config_file_names()[0], DEFAULT_CONFIG_TOML);
    }
}
