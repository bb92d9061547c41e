//! Caller-side invocation manager
//!
//! Every non-oneway call parks an [`InflightRequest`] holding the sending
//! half of a oneshot channel; the caller awaits the receiving half with its
//! timeout. The connection's reader task resolves the entry when the
//! correlated response arrives. Entries are removed exactly once, by
//! whichever of response, failure or timeout comes first.

use async_trait::async_trait;
use brpc_core::{Error, Result};
use brpc_net::Channel;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::codec::{RpcCodec, SerializationFormat};
use crate::protocol::{Headers, Message, MessageType, ResponseBody, TransactionId, APP_NAME_HEADER};
use crate::registry::{MethodDescriptor, ServiceRegistryItem};
use crate::streaming::{RemoteStream, StreamingCallTable};

/// Total write attempts for one request, reconnecting in between
pub const MAX_WRITE_ATTEMPTS: usize = 3;

/// Source of the channel a call is written to
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// A live channel, connecting first if the provider is able to
    async fn channel(&self) -> Result<Arc<Channel>>;

    /// Replace a channel whose write failed
    async fn reconnect(&self) -> Result<Arc<Channel>>;

    /// The current channel, without connecting
    fn current(&self) -> Option<Arc<Channel>>;
}

/// Provider bound to one accepted connection; it cannot reconnect
pub struct FixedChannel {
    channel: Arc<Channel>,
}

impl FixedChannel {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelProvider for FixedChannel {
    async fn channel(&self) -> Result<Arc<Channel>> {
        if self.channel.is_active() {
            Ok(self.channel.clone())
        } else {
            Err(Error::Channel(format!(
                "connection to {} is closed",
                self.channel.peer_addr()
            )))
        }
    }

    async fn reconnect(&self) -> Result<Arc<Channel>> {
        self.channel().await
    }

    fn current(&self) -> Option<Arc<Channel>> {
        Some(self.channel.clone())
    }
}

/// Per-call settings supplied by the stub
#[derive(Debug, Clone, Copy)]
pub struct CallOptions<'a> {
    pub app_name: &'a str,
    pub headers: &'a Headers,
    pub timeout: Duration,
    /// Log the call at info instead of debug
    pub debug: bool,
}

struct InflightRequest {
    request_timestamp: Instant,
    return_type: &'static str,
    channel_id: u64,
    service_name: String,
    method_name: String,
    resolver: oneshot::Sender<Result<Bytes>>,
}

struct PreparedCall {
    channel: Arc<Channel>,
    item: Arc<ServiceRegistryItem>,
    transaction_id: TransactionId,
    frame: Bytes,
}

/// Correlates outgoing requests with incoming responses for one endpoint
pub struct InvocationManager {
    next_transaction_id: AtomicU64,
    inflight: DashMap<TransactionId, InflightRequest>,
    items: DashMap<MethodDescriptor, Arc<ServiceRegistryItem>>,
    streams: Arc<StreamingCallTable>,
    default_serializer: SerializationFormat,
}

impl InvocationManager {
    pub fn new(default_serializer: SerializationFormat) -> Self {
        let seed = rand::thread_rng().gen_range(1..u64::from(u32::MAX));
        Self {
            next_transaction_id: AtomicU64::new(seed),
            inflight: DashMap::new(),
            items: DashMap::new(),
            streams: Arc::new(StreamingCallTable::new()),
            default_serializer,
        }
    }

    pub fn default_serializer(&self) -> SerializationFormat {
        self.default_serializer
    }

    pub fn streams(&self) -> &Arc<StreamingCallTable> {
        &self.streams
    }

    /// Routing data of a descriptor, computed on first use
    pub fn registry_item(&self, descriptor: &MethodDescriptor) -> Arc<ServiceRegistryItem> {
        if let Some(item) = self.items.get(descriptor) {
            return item.value().clone();
        }
        self.items
            .entry(*descriptor)
            .or_insert_with(|| {
                Arc::new(ServiceRegistryItem::from_descriptor(descriptor, self.default_serializer))
            })
            .value()
            .clone()
    }

    fn next_transaction_id(&self) -> TransactionId {
        loop {
            let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a request and, unless the method is oneway, wait for its response.
    ///
    /// Returns `Ok(None)` for oneway methods once the request was written.
    pub async fn invoke<A, R>(
        &self,
        options: &CallOptions<'_>,
        provider: &dyn ChannelProvider,
        descriptor: &MethodDescriptor,
        args: &A,
    ) -> Result<Option<R>>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let call = self.prepare(options, provider, descriptor, args).await?;
        let PreparedCall {
            channel,
            item,
            transaction_id,
            frame,
        } = call;

        if item.is_oneway {
            let channel = self.write_with_retry(provider, channel, transaction_id, frame).await?;
            trace!(
                "Sent oneway {}#{} (txn {}) to {}",
                item.service_name,
                item.method_name,
                transaction_id,
                channel.peer_addr()
            );
            return Ok(None);
        }

        let (resolver, response) = oneshot::channel();
        self.inflight.insert(
            transaction_id,
            InflightRequest {
                request_timestamp: Instant::now(),
                return_type: std::any::type_name::<R>(),
                channel_id: channel.id(),
                service_name: item.service_name.clone(),
                method_name: item.method_name.clone(),
                resolver,
            },
        );

        let channel = match self.write_with_retry(provider, channel, transaction_id, frame).await {
            Ok(channel) => channel,
            Err(e) => {
                self.inflight.remove(&transaction_id);
                return Err(e);
            }
        };

        let outcome = tokio::time::timeout(options.timeout, response).await;
        self.inflight.remove(&transaction_id);

        let bytes = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::CallerSide(format!(
                    "response slot for {}#{} (txn {}) was dropped",
                    item.service_name, item.method_name, transaction_id
                )))
            }
            Err(_) => {
                warn!(
                    "Call {}#{} (txn {}) to {} timed out after {:?}",
                    item.service_name,
                    item.method_name,
                    transaction_id,
                    channel.peer_addr(),
                    options.timeout
                );
                return Err(Error::timeout(
                    channel.peer_addr(),
                    &item.service_name,
                    &item.method_name,
                    options.timeout,
                ));
            }
        };

        RpcCodec::new(item.serializer).deserialize(&bytes).map(Some)
    }

    /// Start a streaming call; values arrive on the returned stream
    pub async fn invoke_streaming<A, T>(
        &self,
        options: &CallOptions<'_>,
        provider: &dyn ChannelProvider,
        descriptor: &MethodDescriptor,
        args: &A,
    ) -> Result<RemoteStream<T>>
    where
        A: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let PreparedCall {
            channel,
            item,
            transaction_id,
            frame,
        } = self.prepare(options, provider, descriptor, args).await?;

        let events = self.streams.register(transaction_id, channel.id());
        let channel = match self.write_with_retry(provider, channel, transaction_id, frame).await {
            Ok(channel) => channel,
            Err(e) => {
                self.streams.finish(transaction_id);
                return Err(e);
            }
        };
        Ok(RemoteStream::new(
            transaction_id,
            events,
            RpcCodec::new(item.serializer),
            self.streams.clone(),
        )
        .cancel_on_drop(channel, self.next_transaction_id()))
    }

    async fn prepare<A>(
        &self,
        options: &CallOptions<'_>,
        provider: &dyn ChannelProvider,
        descriptor: &MethodDescriptor,
        args: &A,
    ) -> Result<PreparedCall>
    where
        A: Serialize + Sync + ?Sized,
    {
        let channel = provider.channel().await?;
        ensure_usable(&channel)?;

        let item = self.registry_item(descriptor);
        let transaction_id = self.next_transaction_id();

        let payload = RpcCodec::new(item.serializer).serialize(args)?;
        let mut headers = options.headers.clone();
        if !options.app_name.is_empty() {
            headers.insert(APP_NAME_HEADER, options.app_name);
        }
        let message = Message::request(
            transaction_id,
            item.is_oneway,
            item.serializer,
            item.service_name.as_str(),
            item.method_name.as_str(),
            headers,
            Bytes::from(payload),
        );
        let frame = message.encode_frame()?;

        if options.debug {
            info!("Invoking {} on {}", message, channel.peer_addr());
        } else {
            debug!("Invoking {} on {}", message, channel.peer_addr());
        }

        Ok(PreparedCall {
            channel,
            item,
            transaction_id,
            frame,
        })
    }

    async fn write_with_retry(
        &self,
        provider: &dyn ChannelProvider,
        mut channel: Arc<Channel>,
        transaction_id: TransactionId,
        frame: Bytes,
    ) -> Result<Arc<Channel>> {
        let mut attempt = 1;
        loop {
            match channel.write(frame.clone()) {
                Ok(()) => return Ok(channel),
                Err(e) if e.is_retryable() && attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(
                        "Write of txn {} failed (attempt {}/{}): {}; reconnecting",
                        transaction_id, attempt, MAX_WRITE_ATTEMPTS, e
                    );
                    attempt += 1;
                    channel = provider.reconnect().await?;
                    if let Some(mut entry) = self.inflight.get_mut(&transaction_id) {
                        entry.channel_id = channel.id();
                    }
                    self.streams.rebind(transaction_id, channel.id());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve the inflight entry a response belongs to
    pub fn on_response(&self, message: Message) {
        let transaction_id = message.transaction_id;
        let result = ResponseBody::decode(message.payload).and_then(ResponseBody::into_result);

        if let Some((_, request)) = self.inflight.remove(&transaction_id) {
            trace!(
                "Response for {}#{} (txn {}, {}) after {:?}",
                request.service_name,
                request.method_name,
                transaction_id,
                request.return_type,
                request.request_timestamp.elapsed()
            );
            let _ = request.resolver.send(result);
        } else if self.streams.on_end(transaction_id, result.map(|_| ())) {
            debug!("Stream {} ended by a response", transaction_id);
        } else {
            debug!("Dropping response for unknown or expired txn {}", transaction_id);
        }
    }

    /// Route `StreamingData`/`StreamingEnd` to the waiting stream
    pub fn on_streaming_message(&self, message: Message) {
        let transaction_id = message.transaction_id;
        let delivered = match message.message_type {
            MessageType::StreamingData => self.streams.on_data(transaction_id, message.payload),
            MessageType::StreamingEnd => {
                let result = ResponseBody::decode(message.payload)
                    .and_then(ResponseBody::into_result)
                    .map(|_| ());
                self.streams.on_end(transaction_id, result)
            }
            other => {
                warn!("Unexpected {:?} routed as stream message", other);
                return;
            }
        };
        if !delivered {
            debug!("Dropping stream message for unknown txn {}", transaction_id);
        }
    }

    /// Fail one inflight call
    pub fn on_client_exception(&self, transaction_id: TransactionId, error: Error) -> bool {
        match self.inflight.remove(&transaction_id) {
            Some((_, request)) => {
                let _ = request.resolver.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every call and stream written through a closed channel
    pub fn on_channel_closed(&self, channel_id: u64) -> usize {
        let affected: Vec<TransactionId> = self
            .inflight
            .iter()
            .filter(|e| e.value().channel_id == channel_id)
            .map(|e| *e.key())
            .collect();

        let failed = affected
            .into_iter()
            .filter(|txn| {
                self.on_client_exception(
                    *txn,
                    Error::Channel(format!("channel {} closed before the response", channel_id)),
                )
            })
            .count();
        failed + self.streams.on_channel_closed(channel_id)
    }

    pub fn pending_request_count(&self) -> usize {
        self.inflight.len()
    }
}

fn ensure_usable(channel: &Channel) -> Result<()> {
    if !channel.is_active() {
        return Err(Error::Channel(format!(
            "channel {} to {} is not active",
            channel.id(),
            channel.peer_addr()
        )));
    }
    if !channel.is_writable() {
        return Err(Error::Channel(format!(
            "channel {} to {} is not writable",
            channel.id(),
            channel.peer_addr()
        )));
    }
    Ok(())
}
