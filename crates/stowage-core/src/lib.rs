//! stowage-core — configuration shared by every Stowage crate.

pub mod config;
pub mod error;

pub use config::{
    CacheConfig, FilterConfig, LoggingConfig, MigrationConfig, SchedulerConfig, Severity,
    SeverityMatrix, StowageConfig, WeigherConfig,
};
pub use error::ConfigError;
