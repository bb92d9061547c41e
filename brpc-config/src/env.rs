//! Environment variable override support

use crate::{config::BrpcConfig, ConfigError, Result};
use std::env;
use std::str::FromStr;

/// Applies `BRPC_*` environment variables on top of a loaded configuration
pub struct EnvOverride;

impl EnvOverride {
    pub fn apply(mut config: BrpcConfig) -> Result<BrpcConfig> {
        // App configuration
        if let Ok(name) = env::var("BRPC_APP_NAME") {
            config.app.name = name;
        }
        if let Ok(version) = env::var("BRPC_APP_VERSION") {
            config.app.version = version;
        }
        if let Ok(environment) = env::var("BRPC_APP_ENVIRONMENT") {
            config.app.environment = environment;
        }

        // Client configuration
        if let Ok(address) = env::var("BRPC_CLIENT_SERVER_ADDRESS") {
            config.client.server_address = address;
        }
        if let Some(timeout) = parse_var("BRPC_CLIENT_CONNECT_TIMEOUT_MS")? {
            config.client.connect_timeout_ms = timeout;
        }
        if let Some(retries) = parse_var("BRPC_CLIENT_MAX_RETRY")? {
            config.client.max_retry = retries;
        }
        if let Some(interval) = parse_var("BRPC_CLIENT_RETRY_INTERVAL_MS")? {
            config.client.retry_interval_ms = interval;
        }
        if let Some(timeout) = parse_var("BRPC_CLIENT_REQUEST_TIMEOUT_MS")? {
            config.client.request_timeout_ms = timeout;
        }
        if let Ok(serializer) = env::var("BRPC_CLIENT_SERIALIZER") {
            config.client.serializer = serializer;
        }

        // Server configuration
        if let Ok(address) = env::var("BRPC_SERVER_BIND_ADDRESS") {
            config.server.bind_address = address;
        }
        if let Ok(executor) = env::var("BRPC_SERVER_EXECUTOR") {
            config.server.executor = executor;
        }
        if let Some(workers) = parse_var("BRPC_SERVER_WORKERS")? {
            config.server.workers = workers;
        }
        if let Ok(serializer) = env::var("BRPC_SERVER_SERIALIZER") {
            config.server.serializer = serializer;
        }
        if let Ok(nodelay) = env::var("BRPC_SERVER_NODELAY") {
            config.server.channel.nodelay = parse_bool(&nodelay)?;
        }

        // Logging configuration
        if let Ok(level) = env::var("BRPC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = env::var("BRPC_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Environment(format!("Invalid {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}

/// Parse boolean from environment variable value
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Environment(format!("Invalid boolean value: {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The only test that sets BRPC_* variables.
    #[test]
    fn test_env_overrides() {
        env::set_var("BRPC_APP_NAME", "from-env");
        env::set_var("BRPC_CLIENT_MAX_RETRY", "9");
        env::set_var("BRPC_SERVER_EXECUTOR", "inline");
        env::set_var("BRPC_SERVER_NODELAY", "off");
        env::set_var("BRPC_LOG_LEVEL", "trace");

        let config = EnvOverride::apply(BrpcConfig::default()).unwrap();
        assert_eq!(config.app.name, "from-env");
        assert_eq!(config.client.max_retry, 9);
        assert_eq!(config.server.executor, "inline");
        assert!(!config.server.channel.nodelay);
        assert_eq!(config.logging.level, "trace");

        env::set_var("BRPC_CLIENT_MAX_RETRY", "many");
        let err = EnvOverride::apply(BrpcConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Environment(msg) if msg.contains("BRPC_CLIENT_MAX_RETRY")));

        for name in [
            "BRPC_APP_NAME",
            "BRPC_CLIENT_MAX_RETRY",
            "BRPC_SERVER_EXECUTOR",
            "BRPC_SERVER_NODELAY",
            "BRPC_LOG_LEVEL",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(parse_bool("yes").unwrap());
        assert!(parse_bool("on").unwrap());

        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(!parse_bool("no").unwrap());
        assert!(!parse_bool("off").unwrap());

        assert!(parse_bool("invalid").is_err());
    }
}
