//! # brpc Networking
//!
//! Framing and connection handling for the brpc transport:
//! - A 4-byte big-endian length-prefixed frame codec
//! - `Channel`: one TCP connection with a reader task, a writer task and
//!   writability-based backpressure
//! - TCP connect/accept helpers that produce channels

pub mod channel;
pub mod frame;
pub mod tcp;

pub use channel::{Channel, ChannelConfig, ChannelStatsSnapshot, FrameHandler};
pub use frame::{encode_frame, encode_frame_into, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_LENGTH, LENGTH_FIELD_LEN};
pub use tcp::{connect, AcceptorStatsSnapshot, TcpAcceptor, TcpConfig, TcpError, TcpResult};
