//! Configuration structures

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level brpc configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrpcConfig {
    /// Application metadata
    #[serde(default)]
    pub app: AppConfig,

    /// Caller side
    #[serde(default)]
    pub client: ClientSettings,

    /// Callee side
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Sent to servers in the `appName` header of every request
    #[serde(default = "default_app_name")]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Outbound queue and frame limits of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Queued bytes above which the channel stops being writable
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Queued bytes below which the channel is writable again
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    #[serde(default = "default_true")]
    pub nodelay: bool,
}

/// Client endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Server to connect to (`host:port`)
    #[serde(default = "default_server_address")]
    pub server_address: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Connection attempts before giving up
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Default per-call timeout of stubs
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Payload serializer (json, msgpack, bincode)
    #[serde(default = "default_serializer")]
    pub serializer: String,

    /// Executor for callbacks served by the client (inline, pool)
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Worker pool size, 0 = available parallelism
    #[serde(default)]
    pub workers: usize,

    #[serde(default)]
    pub channel: ChannelSettings,
}

/// Server endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Default per-call timeout of stubs towards connected clients
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_serializer")]
    pub serializer: String,

    #[serde(default = "default_executor")]
    pub executor: String,

    #[serde(default)]
    pub workers: usize,

    #[serde(default)]
    pub channel: ChannelSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, text)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the event target in text output
    #[serde(default = "default_true")]
    pub with_target: bool,

    #[serde(default = "default_false")]
    pub with_thread_ids: bool,
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_version(),
            environment: default_environment(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            read_buffer_size: default_read_buffer_size(),
            max_frame_length: default_max_frame_length(),
            nodelay: true,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retry: default_max_retry(),
            retry_interval_ms: default_retry_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            serializer: default_serializer(),
            executor: default_executor(),
            workers: 0,
            channel: ChannelSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout_ms: default_request_timeout_ms(),
            serializer: default_serializer(),
            executor: default_executor(),
            workers: 0,
            channel: ChannelSettings::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            with_target: true,
            with_thread_ids: false,
        }
    }
}

fn default_app_name() -> String { "brpc-app".to_string() }
fn default_version() -> String { "0.1.0".to_string() }
fn default_environment() -> String { "development".to_string() }
fn default_high_water_mark() -> usize { 64 * 1024 }
fn default_low_water_mark() -> usize { 32 * 1024 }
fn default_read_buffer_size() -> usize { 8 * 1024 }
fn default_max_frame_length() -> usize { i32::MAX as usize }
fn default_server_address() -> String { "127.0.0.1:9090".to_string() }
fn default_bind_address() -> String { "0.0.0.0:9090".to_string() }
fn default_connect_timeout_ms() -> u64 { 3_000 }
fn default_max_retry() -> u32 { 3 }
fn default_retry_interval_ms() -> u64 { 1_000 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_serializer() -> String { "json".to_string() }
fn default_executor() -> String { "pool".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
fn default_true() -> bool { true }
fn default_false() -> bool { false }
