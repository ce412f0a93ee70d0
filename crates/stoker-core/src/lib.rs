//! Stoker Core - shared foundations for the Stoker background engine
//!
//! This crate provides the error taxonomy and the configuration system
//! used by the execution engine and the command-line driver.

pub mod config;
pub mod error;

pub use config::{CacheConfig, Config, EngineConfig, RemoteConfig};
pub use error::{CacheError, ConfigError, Result, StokerError};
