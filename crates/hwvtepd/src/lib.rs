//! hwvtepd support library
//!
//! Configuration loading and store seeding for the `hwvtepd` binary.

pub mod config_file;
pub mod seed;

pub use config_file::{
    ConfigError, ConfigResult, HwvtepdConfig, LoggingConfig, ReconciliationConfig, WorkersConfig,
    DEFAULT_CONFIG_PATH,
};
pub use seed::SeedFile;
