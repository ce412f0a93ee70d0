//! CLI commands

pub mod cache;
pub mod init;
pub mod run;

pub use cache::CacheCommand;
pub use init::InitCommand;
pub use run::RunCommand;
