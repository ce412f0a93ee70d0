//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_engine(config)?;
    validate_cache(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_engine(config: &Config) -> Result<()> {
    if config.engine.cpu_threads == Some(0) {
        return Err(invalid("engine.cpu_threads", "must be at least 1"));
    }

    if config.engine.disk_threads == 0 {
        return Err(invalid("engine.disk_threads", "must be at least 1"));
    }

    if config.engine.web_max_threads == 0 {
        return Err(invalid("engine.web_max_threads", "must be at least 1"));
    }

    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    if config.cache.disk_max_size_mb == 0 {
        return Err(invalid("cache.disk_max_size_mb", "must be greater than 0"));
    }

    if config.cache.disk_dir.as_os_str().is_empty() {
        return Err(invalid("cache.disk_dir", "cannot be empty"));
    }

    Ok(())
}

fn invalid(field: &str, message: &str) -> crate::error::StokerError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_disk_threads_rejected() {
        let mut config = Config::default();
        config.engine.disk_threads = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("engine.disk_threads"));
    }

    #[test]
    fn test_zero_cpu_threads_rejected() {
        let mut config = Config::default();
        config.engine.cpu_threads = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_disk_size_rejected() {
        let mut config = Config::default();
        config.cache.disk_max_size_mb = 0;
        assert!(validate_config(&config).is_err());
    }
}
