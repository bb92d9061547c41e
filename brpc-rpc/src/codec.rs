//! Payload serializers selected by the serializer id carried in each message

use brpc_core::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::str::FromStr;

/// Serialization format for payloads. The discriminant is the wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializationFormat {
    /// JSON serialization (human-readable)
    Json = 1,
    /// MessagePack serialization (binary, compact)
    MessagePack = 2,
    /// Bincode serialization (binary, fast)
    Bincode = 3,
}

impl SerializationFormat {
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(SerializationFormat::Json),
            2 => Ok(SerializationFormat::MessagePack),
            3 => Ok(SerializationFormat::Bincode),
            other => Err(Error::Serialization(format!("Unknown serializer id {}", other))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Json => "json",
            SerializationFormat::MessagePack => "msgpack",
            SerializationFormat::Bincode => "bincode",
        }
    }
}

impl Default for SerializationFormat {
    fn default() -> Self {
        SerializationFormat::Json
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SerializationFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(SerializationFormat::Json),
            "msgpack" | "messagepack" => Ok(SerializationFormat::MessagePack),
            "bincode" => Ok(SerializationFormat::Bincode),
            other => Err(Error::Configuration(format!("Unknown serializer '{}'", other))),
        }
    }
}

/// Serializer for request arguments, return values and stream items
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcCodec {
    format: SerializationFormat,
}

impl RpcCodec {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    /// Codec for the serializer id found on the wire
    pub fn from_id(id: u8) -> Result<Self> {
        SerializationFormat::from_id(id).map(Self::new)
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self.format {
            SerializationFormat::Json => serde_json::to_vec(value)
                .map_err(|e| Error::Serialization(format!("JSON serialization failed: {}", e))),
            SerializationFormat::MessagePack => rmp_serde::to_vec(value)
                .map_err(|e| Error::Serialization(format!("MessagePack serialization failed: {}", e))),
            SerializationFormat::Bincode => bincode::serialize(value)
                .map_err(|e| Error::Serialization(format!("Bincode serialization failed: {}", e))),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self.format {
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| Error::Serialization(format!("JSON deserialization failed: {}", e))),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| Error::Serialization(format!("MessagePack deserialization failed: {}", e))),
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| Error::Serialization(format!("Bincode deserialization failed: {}", e))),
        }
    }
}
