//! Configuration validation utilities

use crate::{config::*, ConfigError, Result};
use brpc_core::ExecutorKind;
use std::net::SocketAddr;

const SERIALIZERS: [&str; 4] = ["json", "msgpack", "messagepack", "bincode"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Validate complete configuration
pub fn validate_config(config: &BrpcConfig) -> Result<()> {
    validate_app_config(&config.app)?;
    validate_client_settings(&config.client)?;
    validate_server_settings(&config.server)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

pub fn validate_app_config(config: &AppConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(ConfigError::Validation("App name cannot be empty".to_string()));
    }
    Ok(())
}

pub fn validate_client_settings(config: &ClientSettings) -> Result<()> {
    if config.server_address.is_empty() {
        return Err(ConfigError::Missing("client.server_address".to_string()));
    }
    if config.connect_timeout_ms == 0 {
        return Err(ConfigError::Validation("Connect timeout must be greater than 0".to_string()));
    }
    if config.max_retry == 0 {
        return Err(ConfigError::Validation("Max retry must be at least 1".to_string()));
    }
    if config.request_timeout_ms == 0 {
        return Err(ConfigError::Validation("Request timeout must be greater than 0".to_string()));
    }
    validate_serializer(&config.serializer)?;
    validate_executor(&config.executor)?;
    validate_channel_settings(&config.channel)
}

pub fn validate_server_settings(config: &ServerSettings) -> Result<()> {
    config.bind_address.parse::<SocketAddr>().map_err(|_| {
        ConfigError::Validation(format!("Invalid bind address '{}'", config.bind_address))
    })?;
    if config.request_timeout_ms == 0 {
        return Err(ConfigError::Validation("Request timeout must be greater than 0".to_string()));
    }
    validate_serializer(&config.serializer)?;
    validate_executor(&config.executor)?;
    validate_channel_settings(&config.channel)
}

pub fn validate_channel_settings(config: &ChannelSettings) -> Result<()> {
    if config.high_water_mark == 0 {
        return Err(ConfigError::Validation("High water mark must be greater than 0".to_string()));
    }
    if config.low_water_mark > config.high_water_mark {
        return Err(ConfigError::Validation(format!(
            "Low water mark {} exceeds high water mark {}",
            config.low_water_mark, config.high_water_mark
        )));
    }
    if config.read_buffer_size == 0 {
        return Err(ConfigError::Validation("Read buffer size must be greater than 0".to_string()));
    }
    if config.max_frame_length == 0 || config.max_frame_length > i32::MAX as usize {
        return Err(ConfigError::Validation(format!(
            "Max frame length must be between 1 and {}",
            i32::MAX
        )));
    }
    Ok(())
}

pub fn validate_logging_config(config: &LoggingConfig) -> Result<()> {
    // Full filter directives (`brpc_rpc=debug,info`) are accepted as-is.
    if !config.level.contains('=') && !LOG_LEVELS.contains(&config.level.to_lowercase().as_str()) {
        return Err(ConfigError::Validation(format!(
            "Invalid log level '{}'. Valid values: {:?}",
            config.level, LOG_LEVELS
        )));
    }
    if !LOG_FORMATS.contains(&config.format.to_lowercase().as_str()) {
        return Err(ConfigError::Validation(format!(
            "Invalid log format '{}'. Valid values: {:?}",
            config.format, LOG_FORMATS
        )));
    }
    Ok(())
}

fn validate_serializer(name: &str) -> Result<()> {
    if !SERIALIZERS.contains(&name.to_lowercase().as_str()) {
        return Err(ConfigError::Validation(format!(
            "Unknown serializer '{}'. Valid values: {:?}",
            name, SERIALIZERS
        )));
    }
    Ok(())
}

fn validate_executor(name: &str) -> Result<()> {
    name.parse::<ExecutorKind>()
        .map(|_| ())
        .map_err(|e| ConfigError::Validation(e.to_string()))
}
