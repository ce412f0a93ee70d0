//! Exit codes for the CLI

use stoker_core::{ConfigError, StokerError};

use crate::cli::commands::run::JobsFailed;
use crate::workload::WorkloadError;

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// Workload file could not be loaded or is invalid
pub const WORKLOAD_ERROR: i32 = 3;

/// One or more jobs did not succeed
pub const JOB_FAILED: i32 = 4;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Map an error returned by a command to the process exit code
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(failed) = err.downcast_ref::<JobsFailed>() {
        return if failed.interrupted { CANCELLED } else { JOB_FAILED };
    }
    if err.downcast_ref::<WorkloadError>().is_some() {
        return WORKLOAD_ERROR;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return CONFIG_ERROR;
    }
    match err.downcast_ref::<StokerError>() {
        Some(StokerError::Config(_)) => CONFIG_ERROR,
        _ => ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let failed = anyhow::Error::new(JobsFailed {
            failed: 2,
            interrupted: false,
        });
        assert_eq!(for_error(&failed), JOB_FAILED);

        let interrupted = anyhow::Error::new(JobsFailed {
            failed: 1,
            interrupted: true,
        });
        assert_eq!(for_error(&interrupted), CANCELLED);

        let workload = anyhow::Error::new(WorkloadError::Empty);
        assert_eq!(for_error(&workload), WORKLOAD_ERROR);

        let config = anyhow::Error::new(StokerError::Config(ConfigError::InvalidValue {
            field: "engine.disk_threads".to_string(),
            message: "must be at least 1".to_string(),
        }));
        assert_eq!(for_error(&config), CONFIG_ERROR);

        assert_eq!(for_error(&anyhow::anyhow!("boom")), ERROR);
    }
}
