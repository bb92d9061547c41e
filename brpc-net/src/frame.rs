//! Length-prefixed frame codec
//!
//! Wire format: `[length: 4 bytes, big-endian][body: length bytes]`. The
//! length does not include the prefix itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix
pub const LENGTH_FIELD_LEN: usize = 4;

/// Largest frame accepted by default; in practice bounded by memory
pub const DEFAULT_MAX_FRAME_LENGTH: usize = i32::MAX as usize;

/// Upper bound of a single reservation made for a partially received frame
const MAX_RESERVE: usize = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },
    #[error("Frame body of {0} bytes cannot be length-prefixed")]
    BodyTooLarge(usize),
}

impl From<FrameError> for brpc_core::Error {
    fn from(err: FrameError) -> Self {
        brpc_core::Error::Protocol(err.to_string())
    }
}

/// Append one frame to `dst`
pub fn encode_frame_into(body: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let length = u32::try_from(body.len()).map_err(|_| FrameError::BodyTooLarge(body.len()))?;
    dst.reserve(LENGTH_FIELD_LEN + body.len());
    dst.put_u32(length);
    dst.put_slice(body);
    Ok(())
}

/// Encode one frame into a fresh buffer
pub fn encode_frame(body: &[u8]) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(LENGTH_FIELD_LEN + body.len());
    encode_frame_into(body, &mut dst)?;
    Ok(dst.freeze())
}

/// Incremental decoder; partial frames stay in the source buffer
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_length: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Take the next complete frame body out of `src`
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_length {
            return Err(FrameError::TooLong {
                length,
                max: self.max_frame_length,
            });
        }

        let total = LENGTH_FIELD_LEN + length;
        if src.len() < total {
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }

    /// Drain every complete frame currently buffered
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}
