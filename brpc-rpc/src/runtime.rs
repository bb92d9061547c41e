//! Per-endpoint runtime state and the message handler shared by both ends
//!
//! Client connections and server sessions use the same handler: requests go
//! to the local dispatcher, responses and stream messages to the local
//! invocation manager.

use brpc_config::ChannelSettings;
use brpc_core::{DispatchExecutor, Result};
use brpc_net::{Channel, ChannelConfig, FrameHandler};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::codec::SerializationFormat;
use crate::dispatcher::Dispatcher;
use crate::invocation::InvocationManager;
use crate::protocol::{Message, MessageType};
use crate::registry::ServiceRegistry;
use crate::session::SessionManager;
use crate::streaming::{cancel_service, StreamingContextTable, STREAMING_SERVICE};

/// State owned by one client or server instance
pub struct RpcRuntime {
    registry: Arc<ServiceRegistry>,
    invocations: Arc<InvocationManager>,
    streams: Arc<StreamingContextTable>,
    dispatcher: Dispatcher,
}

impl RpcRuntime {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        executor: DispatchExecutor,
        serializer: SerializationFormat,
    ) -> Result<Arc<Self>> {
        if !registry.contains(STREAMING_SERVICE) {
            registry.add_service(cancel_service())?;
        }
        let streams = Arc::new(StreamingContextTable::new());
        Ok(Arc::new(Self {
            dispatcher: Dispatcher::new(registry.clone(), executor, streams.clone()),
            invocations: Arc::new(InvocationManager::new(serializer)),
            registry,
            streams,
        }))
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn invocations(&self) -> &Arc<InvocationManager> {
        &self.invocations
    }

    pub fn streams(&self) -> &Arc<StreamingContextTable> {
        &self.streams
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Channel buffering of a configured endpoint
pub(crate) fn channel_config(settings: &ChannelSettings) -> ChannelConfig {
    ChannelConfig {
        high_water_mark: settings.high_water_mark,
        low_water_mark: settings.low_water_mark,
        read_buffer_size: settings.read_buffer_size,
        max_frame_length: settings.max_frame_length,
    }
}

type CloseHook = Box<dyn Fn(&Arc<Channel>) + Send + Sync>;

/// Routes decoded messages of a channel into the runtime
pub struct MessageHandler {
    runtime: Arc<RpcRuntime>,
    sessions: Option<Arc<SessionManager>>,
    close_hook: Option<CloseHook>,
}

impl MessageHandler {
    pub fn new(runtime: Arc<RpcRuntime>) -> Self {
        Self {
            runtime,
            sessions: None,
            close_hook: None,
        }
    }

    /// Track identified peers as sessions
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Run `hook` after the channel's calls and streams were failed
    pub fn on_channel_closed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Channel>) + Send + Sync + 'static,
    {
        self.close_hook = Some(Box::new(hook));
        self
    }
}

impl FrameHandler for MessageHandler {
    fn on_frame(&self, channel: &Arc<Channel>, frame: Bytes) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Closing channel {} from {}: {}",
                    channel.id(),
                    channel.peer_addr(),
                    e
                );
                channel.close();
                return;
            }
        };
        trace!("Received {} on channel {}", message, channel.id());

        match message.message_type {
            MessageType::ClientRequest | MessageType::ClientRequestOneway => {
                if let Some(sessions) = &self.sessions {
                    sessions.on_request(channel, &message);
                }
                self.runtime.dispatcher.dispatch(channel, message);
            }
            MessageType::ServerResponse => self.runtime.invocations.on_response(message),
            MessageType::StreamingData | MessageType::StreamingEnd => {
                self.runtime.invocations.on_streaming_message(message)
            }
        }
    }

    fn on_close(&self, channel: &Arc<Channel>) {
        let failed = self.runtime.invocations.on_channel_closed(channel.id());
        let cancelled = self.runtime.streams.close_channel(channel.id());
        if let Some(sessions) = &self.sessions {
            sessions.remove(channel.id());
        }
        debug!(
            "Channel {} closed: {} calls failed, {} streams cancelled",
            channel.id(),
            failed,
            cancelled
        );
        if let Some(hook) = &self.close_hook {
            hook(channel);
        }
    }
}
