//! Server-push streaming layered on unary calls
//!
//! Callee side: a streaming invocation registers a [`StreamingContext`] in
//! the endpoint's [`StreamingContextTable`], keyed by `(channel id,
//! transaction id)`. The handler pushes values through a [`StreamSink`];
//! each value becomes a `StreamingData` message and the stream ends with one
//! `StreamingEnd`. A context moves `Active -> Completed` or
//! `Active -> Cancelled` and sends nothing after either.
//!
//! Caller side: [`StreamingCallTable`] routes data and end messages by
//! transaction id into the matching [`RemoteStream`].

use brpc_core::{Error, Result};
use brpc_net::Channel;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::{RpcCodec, SerializationFormat};
use crate::protocol::{Headers, Message, TransactionId};
use crate::registry::{CallContext, MethodDefinition, MethodDescriptor, ServiceDefinition, ServiceInvoker};

/// Service name of the built-in streaming control service
pub const STREAMING_SERVICE: &str = "brpc.streaming";

/// Oneway method cancelling a stream; argument `(transaction_id,)`
pub const CANCEL_METHOD: &str = "cancel";

pub const CANCEL_STREAMING: MethodDescriptor = MethodDescriptor::oneway(STREAMING_SERVICE, CANCEL_METHOD);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    Completed,
    Cancelled,
}

/// Callee-side state of one streaming call
pub struct StreamingContext {
    channel: Arc<Channel>,
    transaction_id: TransactionId,
    codec: RpcCodec,
    state: Mutex<StreamState>,
    table: Weak<StreamingContextTable>,
}

impl StreamingContext {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// True after an explicit cancel or once the channel went inactive
    pub fn is_cancelled(&self) -> bool {
        if self.state() == StreamState::Active && !self.channel.is_active() {
            self.cancel();
        }
        self.state() == StreamState::Cancelled
    }

    /// Move to `Cancelled`; false if the stream had already ended
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != StreamState::Active {
                return false;
            }
            *state = StreamState::Cancelled;
        }
        debug!(
            "Cancelled stream {} on channel {}",
            self.transaction_id,
            self.channel.id()
        );
        self.detach();
        true
    }

    fn send_value(&self, value: Bytes) -> bool {
        {
            let state = self.state.lock();
            if *state != StreamState::Active {
                return false;
            }
            if self.channel.is_writable() {
                let message = Message::streaming_data(self.transaction_id, self.codec.format().id(), value);
                match message.encode_frame().and_then(|frame| self.channel.write(frame)) {
                    Ok(()) => return true,
                    Err(e) => debug!("Stream {} write failed: {}", self.transaction_id, e),
                }
            } else {
                debug!(
                    "Channel {} not writable, cancelling stream {}",
                    self.channel.id(),
                    self.transaction_id
                );
            }
        }
        self.cancel();
        false
    }

    /// Move to `Completed`, writing the end message; false if already ended
    pub(crate) fn finish(&self, error: Option<&str>) -> bool {
        {
            let mut state = self.state.lock();
            if *state != StreamState::Active {
                return false;
            }
            *state = StreamState::Completed;
            let message = Message::streaming_end(self.transaction_id, self.codec.format().id(), error);
            if let Err(e) = message.encode_frame().and_then(|frame| self.channel.write(frame)) {
                debug!("Stream {} end not delivered: {}", self.transaction_id, e);
            }
        }
        self.detach();
        true
    }

    fn detach(&self) {
        if let Some(table) = self.table.upgrade() {
            table.contexts.remove(&(self.channel.id(), self.transaction_id));
        }
    }
}

/// Handler-facing end of a stream
pub struct StreamSink<T> {
    context: Arc<StreamingContext>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> StreamSink<T> {
    pub(crate) fn new(context: Arc<StreamingContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    /// Push one value; returns false once the stream is no longer active
    pub fn on_next(&self, value: &T) -> bool {
        match self.context.codec.serialize(value) {
            Ok(bytes) => self.context.send_value(Bytes::from(bytes)),
            Err(e) => {
                self.on_error(e.to_string());
                false
            }
        }
    }

    pub fn on_complete(&self) {
        self.context.finish(None);
    }

    pub fn on_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.context.finish(Some(&message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.context.transaction_id
    }
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            _marker: PhantomData,
        }
    }
}

/// Active callee-side streams of one endpoint
#[derive(Default)]
pub struct StreamingContextTable {
    contexts: DashMap<(u64, TransactionId), Arc<StreamingContext>>,
}

impl StreamingContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        transaction_id: TransactionId,
        serializer: SerializationFormat,
    ) -> Arc<StreamingContext> {
        let context = Arc::new(StreamingContext {
            transaction_id,
            codec: RpcCodec::new(serializer),
            state: Mutex::new(StreamState::Active),
            table: Arc::downgrade(self),
            channel,
        });
        self.contexts
            .insert((context.channel.id(), transaction_id), context.clone());
        trace!("Opened stream {} on channel {}", transaction_id, context.channel.id());
        context
    }

    pub fn get(&self, channel_id: u64, transaction_id: TransactionId) -> Option<Arc<StreamingContext>> {
        self.contexts
            .get(&(channel_id, transaction_id))
            .map(|e| e.value().clone())
    }

    pub fn cancel(&self, channel_id: u64, transaction_id: TransactionId) -> bool {
        match self.get(channel_id, transaction_id) {
            Some(context) => context.cancel(),
            None => false,
        }
    }

    /// Cancel every stream of a closed channel
    pub fn close_channel(&self, channel_id: u64) -> usize {
        let owned: Vec<Arc<StreamingContext>> = self
            .contexts
            .iter()
            .filter(|e| e.key().0 == channel_id)
            .map(|e| e.value().clone())
            .collect();
        owned.iter().filter(|context| context.cancel()).count()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

struct CancelStreamInvoker;

impl ServiceInvoker for CancelStreamInvoker {
    fn invoke(&self, ctx: &CallContext, args: &[u8]) -> Result<Option<Vec<u8>>> {
        let (transaction_id,): (TransactionId,) = ctx
            .codec
            .deserialize(args)
            .map_err(|e| Error::BadRequest(e.to_string()))?;
        if !ctx.streams.cancel(ctx.channel.id(), transaction_id) {
            debug!("Cancel for unknown stream {} on channel {}", transaction_id, ctx.channel.id());
        }
        Ok(None)
    }

    fn is_oneway(&self) -> bool {
        true
    }

    // Streaming handlers may hold every executor slot until cancelled
    fn runs_inline(&self) -> bool {
        true
    }

    fn parameter_types(&self) -> &'static str {
        std::any::type_name::<(TransactionId,)>()
    }
}

/// Built-in service answering stream cancellation
pub fn cancel_service() -> ServiceDefinition {
    ServiceDefinition::new(STREAMING_SERVICE)
        .with_description("Stream control")
        .method(MethodDefinition::from_invoker(CANCEL_METHOD, Arc::new(CancelStreamInvoker)))
}

pub(crate) enum StreamEvent {
    Data(Bytes),
    End(Result<()>),
}

struct StreamingCall {
    channel_id: u64,
    events: mpsc::UnboundedSender<StreamEvent>,
}

/// Caller-side streams awaiting data, keyed by transaction id
#[derive(Default)]
pub struct StreamingCallTable {
    calls: DashMap<TransactionId, StreamingCall>,
}

impl StreamingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        transaction_id: TransactionId,
        channel_id: u64,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        self.calls.insert(transaction_id, StreamingCall { channel_id, events });
        rx
    }

    pub(crate) fn rebind(&self, transaction_id: TransactionId, channel_id: u64) {
        if let Some(mut call) = self.calls.get_mut(&transaction_id) {
            call.channel_id = channel_id;
        }
    }

    pub fn on_data(&self, transaction_id: TransactionId, value: Bytes) -> bool {
        match self.calls.get(&transaction_id) {
            Some(call) => call.events.send(StreamEvent::Data(value)).is_ok(),
            None => false,
        }
    }

    pub fn on_end(&self, transaction_id: TransactionId, result: Result<()>) -> bool {
        match self.calls.remove(&transaction_id) {
            Some((_, call)) => {
                let _ = call.events.send(StreamEvent::End(result));
                true
            }
            None => false,
        }
    }

    /// End the local stream without an event
    pub fn finish(&self, transaction_id: TransactionId) -> bool {
        self.calls.remove(&transaction_id).is_some()
    }

    pub fn on_channel_closed(&self, channel_id: u64) -> usize {
        let open: Vec<TransactionId> = self
            .calls
            .iter()
            .filter(|e| e.value().channel_id == channel_id)
            .map(|e| *e.key())
            .collect();
        open.into_iter()
            .filter(|txn| {
                self.on_end(
                    *txn,
                    Err(Error::Channel(format!("channel {} closed during stream", channel_id))),
                )
            })
            .count()
    }

    pub fn contains(&self, transaction_id: TransactionId) -> bool {
        self.calls.contains_key(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Where to send the cancel of a stream dropped before it ended
struct DropCancel {
    channel: Arc<Channel>,
    request_id: TransactionId,
}

/// Values pushed by the callee for one streaming call.
///
/// Dropping the stream before it ended asks the callee to stop it.
pub struct RemoteStream<T> {
    transaction_id: TransactionId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    codec: RpcCodec,
    calls: Arc<StreamingCallTable>,
    done: bool,
    drop_cancel: Option<DropCancel>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RemoteStream<T> {
    pub(crate) fn new(
        transaction_id: TransactionId,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        codec: RpcCodec,
        calls: Arc<StreamingCallTable>,
    ) -> Self {
        Self {
            transaction_id,
            events,
            codec,
            calls,
            done: false,
            drop_cancel: None,
            _marker: PhantomData,
        }
    }

    /// Cancel the remote stream through `channel` if dropped unfinished;
    /// `request_id` is the transaction id of that oneway request
    pub(crate) fn cancel_on_drop(mut self, channel: Arc<Channel>, request_id: TransactionId) -> Self {
        self.drop_cancel = Some(DropCancel { channel, request_id });
        self
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// `Some(Ok(_))` per value, `Some(Err(_))` once on a remote error,
    /// `None` after completion
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(bytes)) => Some(self.codec.deserialize(&bytes)),
            Some(StreamEvent::End(Err(e))) => {
                self.done = true;
                Some(Err(e))
            }
            Some(StreamEvent::End(Ok(()))) | None => {
                self.done = true;
                None
            }
        }
    }

    /// Drain the stream, stopping at the first error
    pub async fn try_collect(mut self) -> Result<Vec<T>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await {
            values.push(value?);
        }
        Ok(values)
    }
}

impl<T> Drop for RemoteStream<T> {
    fn drop(&mut self) {
        // Nothing to cancel once the stream ended or was cancelled explicitly
        if self.done || !self.calls.finish(self.transaction_id) {
            return;
        }
        let Some(cancel) = &self.drop_cancel else {
            return;
        };
        let sent = self
            .codec
            .serialize(&(self.transaction_id,))
            .and_then(|args| {
                Message::request(
                    cancel.request_id,
                    true,
                    self.codec.format(),
                    STREAMING_SERVICE,
                    CANCEL_METHOD,
                    Headers::new(),
                    Bytes::from(args),
                )
                .encode_frame()
            })
            .and_then(|frame| cancel.channel.write(frame));
        match sent {
            Ok(()) => debug!("Cancelled dropped stream {}", self.transaction_id),
            Err(e) => debug!("Cancel of dropped stream {} not sent: {}", self.transaction_id, e),
        }
    }
}
