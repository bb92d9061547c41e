//! # brpc configuration
//!
//! Endpoint configuration for brpc clients and servers, loaded from YAML,
//! TOML or JSON files with `BRPC_*` environment variable overrides, plus
//! the logging set-up used by binaries.

pub mod config;
pub mod env;
pub mod loader;
pub mod logging;
pub mod validation;

pub use config::*;
pub use env::EnvOverride;
pub use loader::{ConfigFormat, ConfigLoader};
pub use logging::init_logging;
pub use validation::validate_config;

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Logging initialization error: {0}")]
    Logging(String),
}

impl From<ConfigError> for brpc_core::Error {
    fn from(err: ConfigError) -> Self {
        brpc_core::Error::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
