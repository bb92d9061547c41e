//! Message model and binary envelope
//!
//! Frame body layout (all integers big-endian):
//!
//! ```text
//! [u8 type][u64 transaction id][u8 serializer]
//! [u16 len][service name][u16 len][method name]
//! [u16 header count]([u16 len][key][u16 len][value])*
//! [payload]
//! ```
//!
//! Responses and stream ends start their payload with a status byte:
//! `0` followed by the value, `1` followed by a UTF-8 error string.

use brpc_core::{Error, Result};
use brpc_net::LENGTH_FIELD_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::codec::SerializationFormat;

/// Correlates a response or stream message with its request
pub type TransactionId = u64;

/// Header carrying the caller's application name
pub const APP_NAME_HEADER: &str = "appName";

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Kind of a wire message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ClientRequest = 1,
    ClientRequestOneway = 2,
    ServerResponse = 3,
    StreamingData = 4,
    StreamingEnd = 5,
}

impl MessageType {
    pub fn is_request(self) -> bool {
        matches!(self, MessageType::ClientRequest | MessageType::ClientRequestOneway)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::ClientRequest),
            2 => Ok(MessageType::ClientRequestOneway),
            3 => Ok(MessageType::ServerResponse),
            4 => Ok(MessageType::StreamingData),
            5 => Ok(MessageType::StreamingEnd),
            other => Err(Error::Protocol(format!("Unknown message type {}", other))),
        }
    }
}

/// Ordered string map with case-sensitive keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, keeping the position of an existing key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Append without looking for an existing key; lookups see the first entry
    fn push(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` over this map
    pub fn extend_from(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// One wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    /// Payload codec id, see [`SerializationFormat::id`]
    pub serializer: u8,
    pub service_name: String,
    pub method_name: String,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Message {
    pub fn request(
        transaction_id: TransactionId,
        oneway: bool,
        serializer: SerializationFormat,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        headers: Headers,
        payload: Bytes,
    ) -> Self {
        Self {
            message_type: if oneway {
                MessageType::ClientRequestOneway
            } else {
                MessageType::ClientRequest
            },
            transaction_id,
            serializer: serializer.id(),
            service_name: service_name.into(),
            method_name: method_name.into(),
            headers,
            payload,
        }
    }

    /// Response correlated with the request's transaction id and serializer
    pub fn response(transaction_id: TransactionId, serializer: u8, body: &ResponseBody) -> Self {
        Self::reply(MessageType::ServerResponse, transaction_id, serializer, body.encode())
    }

    pub fn streaming_data(transaction_id: TransactionId, serializer: u8, value: Bytes) -> Self {
        Self::reply(MessageType::StreamingData, transaction_id, serializer, value)
    }

    pub fn streaming_end(transaction_id: TransactionId, serializer: u8, error: Option<&str>) -> Self {
        let body = match error {
            Some(msg) => ResponseBody::Error(msg.to_string()),
            None => ResponseBody::Value(Bytes::new()),
        };
        Self::reply(MessageType::StreamingEnd, transaction_id, serializer, body.encode())
    }

    fn reply(message_type: MessageType, transaction_id: TransactionId, serializer: u8, payload: Bytes) -> Self {
        Self {
            message_type,
            transaction_id,
            serializer,
            service_name: String::new(),
            method_name: String::new(),
            headers: Headers::new(),
            payload,
        }
    }

    fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| 4 + k.len() + v.len())
            .sum();
        1 + 8 + 1 + 2 + self.service_name.len() + 2 + self.method_name.len() + 2 + headers + self.payload.len()
    }

    fn encode_body(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.message_type as u8);
        dst.put_u64(self.transaction_id);
        dst.put_u8(self.serializer);
        put_str(dst, &self.service_name)?;
        put_str(dst, &self.method_name)?;
        let count = u16::try_from(self.headers.len())
            .map_err(|_| Error::Protocol(format!("Too many headers: {}", self.headers.len())))?;
        dst.put_u16(count);
        for (k, v) in self.headers.iter() {
            put_str(dst, k)?;
            put_str(dst, v)?;
        }
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Frame body without the length prefix
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_body(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Complete frame including the length prefix, ready for a channel
    pub fn encode_frame(&self) -> Result<Bytes> {
        let len = self.encoded_len();
        let prefix = u32::try_from(len)
            .map_err(|_| Error::Protocol(format!("Message of {} bytes is too large", len)))?;
        let mut dst = BytesMut::with_capacity(LENGTH_FIELD_LEN + len);
        dst.put_u32(prefix);
        self.encode_body(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode a frame body produced by [`Message::encode`]
    pub fn decode(mut src: Bytes) -> Result<Self> {
        let message_type = MessageType::try_from(get_u8(&mut src)?)?;
        ensure(&src, 9)?;
        let transaction_id = src.get_u64();
        let serializer = src.get_u8();
        let service_name = get_str(&mut src)?;
        let method_name = get_str(&mut src)?;
        ensure(&src, 2)?;
        let count = src.get_u16();
        let mut headers = Headers {
            entries: Vec::with_capacity(usize::from(count).min(src.remaining() / 4)),
        };
        for _ in 0..count {
            let key = get_str(&mut src)?;
            let value = get_str(&mut src)?;
            headers.push(key, value);
        }

        Ok(Self {
            message_type,
            transaction_id,
            serializer,
            service_name,
            method_name,
            headers,
            payload: src,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(txn={}, {}#{}, {} bytes)",
            self.message_type,
            self.transaction_id,
            self.service_name,
            self.method_name,
            self.payload.len()
        )
    }
}

/// Payload of a response or stream end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Value(Bytes),
    Error(String),
}

impl ResponseBody {
    pub fn encode(&self) -> Bytes {
        match self {
            ResponseBody::Value(value) => {
                let mut dst = BytesMut::with_capacity(1 + value.len());
                dst.put_u8(STATUS_OK);
                dst.put_slice(value);
                dst.freeze()
            }
            ResponseBody::Error(msg) => {
                let mut dst = BytesMut::with_capacity(1 + msg.len());
                dst.put_u8(STATUS_ERROR);
                dst.put_slice(msg.as_bytes());
                dst.freeze()
            }
        }
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        match get_u8(&mut payload)? {
            STATUS_OK => Ok(ResponseBody::Value(payload)),
            STATUS_ERROR => String::from_utf8(payload.to_vec())
                .map(ResponseBody::Error)
                .map_err(|e| Error::Protocol(format!("Error message is not UTF-8: {}", e))),
            other => Err(Error::Protocol(format!("Unknown response status {}", other))),
        }
    }

    /// Value bytes, or the remote error as a callee side error
    pub fn into_result(self) -> Result<Bytes> {
        match self {
            ResponseBody::Value(value) => Ok(value),
            ResponseBody::Error(msg) => Err(Error::CalleeSide(msg)),
        }
    }
}

fn put_str(dst: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::Protocol(format!("String of {} bytes exceeds u16 length", s.len())))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn ensure(src: &Bytes, n: usize) -> Result<()> {
    if src.remaining() < n {
        return Err(Error::Protocol(format!(
            "Truncated message: need {} bytes, have {}",
            n,
            src.remaining()
        )));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn get_str(src: &mut Bytes) -> Result<String> {
    ensure(src, 2)?;
    let len = src.get_u16() as usize;
    ensure(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Protocol(format!("Invalid UTF-8 string: {}", e)))
}
