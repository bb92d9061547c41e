//! # brpc RPC
//!
//! Bidirectional RPC over framed TCP channels.
//!
//! This crate provides:
//! - The binary message model and pluggable payload serializers (JSON, MessagePack, Bincode)
//! - A service registry of unary, oneway and streaming methods
//! - Transaction-id correlation of responses with per-call timeouts
//! - Server-push streaming with cooperative cancellation
//! - Clients with reconnect, servers with per-application sessions

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod invocation;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod session;
pub mod streaming;
pub mod stub;

// Client exports
pub use client::{EndpointProvider, RpcClient, RpcClientBuilder, RpcClientConfig};

// Server exports
pub use server::{RpcServer, RpcServerBuilder, RpcServerConfig};
pub use session::{Session, SessionManager};

// Protocol exports
pub use codec::{RpcCodec, SerializationFormat};
pub use protocol::{Headers, Message, MessageType, ResponseBody, TransactionId, APP_NAME_HEADER};

// Service exports
pub use dispatcher::Dispatcher;
pub use invocation::{CallOptions, ChannelProvider, FixedChannel, InvocationManager};
pub use registry::{
    CallContext, MethodDefinition, MethodDescriptor, MethodKind, ServiceDefinition, ServiceInvoker,
    ServiceRegistry, ServiceRegistryItem,
};
pub use runtime::{MessageHandler, RpcRuntime};
pub use streaming::{
    cancel_service, RemoteStream, StreamSink, StreamState, StreamingCallTable, StreamingContext,
    StreamingContextTable, CANCEL_STREAMING,
};
pub use stub::ServiceStub;

/// Common imports for brpc applications
pub mod prelude {
    pub use crate::client::{RpcClient, RpcClientBuilder};
    pub use crate::codec::SerializationFormat;
    pub use crate::registry::{MethodDefinition, MethodDescriptor, ServiceDefinition, ServiceRegistry};
    pub use crate::server::{RpcServer, RpcServerBuilder};
    pub use crate::streaming::{RemoteStream, StreamSink};
    pub use crate::stub::ServiceStub;
    pub use brpc_core::{Error, Result};
    pub use serde::{Deserialize, Serialize};
}
