//! Configuration loading utilities

use crate::{config::BrpcConfig, ConfigError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "toml" => Some(ConfigFormat::Toml),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }

    pub fn parse(self, content: &str) -> Result<BrpcConfig> {
        match self {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(ConfigError::Yaml),
            ConfigFormat::Toml => toml::from_str(content).map_err(ConfigError::Toml),
            ConfigFormat::Json => serde_json::from_str(content).map_err(ConfigError::Json),
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    file_names: Vec<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("config"),
                PathBuf::from("/etc/brpc"),
            ],
            file_names: vec!["brpc".to_string()],
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Search `path` after the default locations
    pub fn add_search_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Only search the given locations
    pub fn with_search_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.file_names.push(name.into());
        self
    }

    /// Load configuration from a specific file
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<BrpcConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let format = ConfigFormat::from_extension(path).unwrap_or(ConfigFormat::Yaml);
        format.parse(&content)
    }

    /// Load the first configuration file found, or the defaults
    pub fn load(&self) -> Result<BrpcConfig> {
        match self.find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                self.load_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(BrpcConfig::default())
            }
        }
    }

    /// Load, apply `BRPC_*` overrides and validate
    pub fn load_with_env(&self) -> Result<BrpcConfig> {
        let config = crate::env::EnvOverride::apply(self.load()?)?;
        crate::validation::validate_config(&config)?;
        Ok(config)
    }

    /// Validate configuration file without keeping it
    pub fn validate_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config = self.load_file(path)?;
        crate::validation::validate_config(&config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        const EXTENSIONS: [&str; 4] = ["yaml", "yml", "toml", "json"];

        self.search_paths.iter().find_map(|dir| {
            self.file_names.iter().find_map(|name| {
                EXTENSIONS
                    .iter()
                    .map(|ext| dir.join(format!("{}.{}", name, ext)))
                    .find(|path| path.is_file())
            })
        })
    }
}
