//! Callee-side dispatch of decoded requests
//!
//! Validation and lookup happen on the reader task; the handler body runs on
//! the dispatch executor. Inline control methods, such as stream
//! cancellation, run directly on the reader task.

use brpc_core::{DispatchExecutor, Error};
use brpc_net::Channel;
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::codec::RpcCodec;
use crate::protocol::{Message, MessageType, ResponseBody, TransactionId};
use crate::registry::{CallContext, ServiceRegistry};
use crate::streaming::StreamingContextTable;

pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    executor: DispatchExecutor,
    streams: Arc<StreamingContextTable>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        executor: DispatchExecutor,
        streams: Arc<StreamingContextTable>,
    ) -> Self {
        Self {
            registry,
            executor,
            streams,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &DispatchExecutor {
        &self.executor
    }

    /// Execute a `ClientRequest` or `ClientRequestOneway`
    pub fn dispatch(&self, channel: &Arc<Channel>, request: Message) {
        let oneway = request.message_type == MessageType::ClientRequestOneway;
        let reply = Reply {
            channel: channel.clone(),
            transaction_id: request.transaction_id,
            serializer: request.serializer,
            oneway,
        };

        if request.service_name.is_empty() || request.method_name.is_empty() {
            reply.fail(
                &request,
                Error::BadRequest(format!(
                    "missing service or method name in txn {}",
                    request.transaction_id
                )),
            );
            return;
        }

        let Some(invoker) = self
            .registry
            .find_invoker(&request.service_name, &request.method_name)
        else {
            let err = Error::ServiceNotFound {
                service: request.service_name.clone(),
                method: request.method_name.clone(),
            };
            reply.fail(&request, err);
            return;
        };

        let codec = match RpcCodec::from_id(request.serializer) {
            Ok(codec) => codec,
            Err(e) => {
                reply.fail(&request, Error::BadRequest(e.to_string()));
                return;
            }
        };

        let stream = invoker
            .is_streaming()
            .then(|| self.streams.open(channel.clone(), request.transaction_id, codec.format()));

        let Message {
            service_name,
            method_name,
            headers,
            payload,
            ..
        } = request;
        let ctx = CallContext {
            channel: channel.clone(),
            transaction_id: reply.transaction_id,
            codec,
            headers,
            stream,
            streams: self.streams.clone(),
        };

        debug!(
            "Dispatching {}#{} (txn {}) from {}",
            service_name,
            method_name,
            ctx.transaction_id,
            channel.peer_addr()
        );

        let inline = invoker.runs_inline();
        let run = move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| invoker.invoke(&ctx, &payload)))
                .unwrap_or_else(|panic| Err(Error::ServiceInvocation(panic_message(panic))));

            match outcome {
                Ok(Some(value)) if !reply.oneway => {
                    reply.send(ResponseBody::Value(Bytes::from(value)));
                }
                Ok(_) => {}
                Err(e) => {
                    if e.is_request_error() {
                        warn!(
                            "Rejected {}#{} (txn {}): {}",
                            service_name, method_name, ctx.transaction_id, e
                        );
                    } else {
                        error!(
                            "Service {}#{} (txn {}) failed: {}",
                            service_name, method_name, ctx.transaction_id, e
                        );
                    }
                    match &ctx.stream {
                        Some(stream) => {
                            stream.finish(Some(&e.to_string()));
                        }
                        None if !reply.oneway => reply.send(ResponseBody::Error(e.to_string())),
                        None => {}
                    }
                }
            }
        };

        if inline {
            run();
        } else {
            self.executor.execute(run);
        }
    }
}

struct Reply {
    channel: Arc<Channel>,
    transaction_id: TransactionId,
    serializer: u8,
    oneway: bool,
}

impl Reply {
    /// Reject a request before it reached the executor
    fn fail(&self, request: &Message, err: Error) {
        if err.is_request_error() {
            warn!(
                "Rejected {} from {}: {}",
                request,
                self.channel.peer_addr(),
                err
            );
        } else {
            error!("Failed {} from {}: {}", request, self.channel.peer_addr(), err);
        }
        if !self.oneway {
            self.send(ResponseBody::Error(err.to_string()));
        }
    }

    fn send(&self, body: ResponseBody) {
        let message = Message::response(self.transaction_id, self.serializer, &body);
        if let Err(e) = message
            .encode_frame()
            .and_then(|frame| self.channel.write(frame))
        {
            warn!(
                "Dropping response for txn {} to {}: {}",
                self.transaction_id,
                self.channel.peer_addr(),
                e
            );
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SerializationFormat;
    use crate::protocol::Headers;
    use crate::registry::{MethodDefinition, ServiceDefinition};
    use brpc_net::{ChannelConfig, FrameHandler};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    struct Ignore;

    impl FrameHandler for Ignore {
        fn on_frame(&self, _channel: &Arc<Channel>, _frame: Bytes) {}
    }

    async fn setup() -> (Dispatcher, Arc<Channel>, TcpStream) {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .add_service(
                ServiceDefinition::new("IMath")
                    .method(MethodDefinition::unary("add", |(a, b): (i64, i64)| Ok(a + b)))
                    .method(MethodDefinition::unary("explode", |(): ()| -> brpc_core::Result<u32> {
                        panic!("kaboom")
                    })),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(
            registry,
            DispatchExecutor::inline(),
            Arc::new(StreamingContextTable::new()),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let channel = Channel::spawn(accepted.unwrap().0, ChannelConfig::default(), Arc::new(Ignore)).unwrap();
        (dispatcher, channel, client.unwrap())
    }

    fn request(service: &str, method: &str, payload: Vec<u8>) -> Message {
        Message::request(42, false, SerializationFormat::Json, service, method, Headers::new(), Bytes::from(payload))
    }

    async fn read_response(peer: &mut TcpStream) -> (TransactionId, ResponseBody) {
        let len = peer.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        peer.read_exact(&mut body).await.unwrap();
        let message = Message::decode(Bytes::from(body)).unwrap();
        assert_eq!(message.message_type, MessageType::ServerResponse);
        (message.transaction_id, ResponseBody::decode(message.payload).unwrap())
    }

    #[tokio::test]
    async fn test_successful_call_writes_value() {
        let (dispatcher, channel, mut peer) = setup().await;
        let args = RpcCodec::default().serialize(&(2i64, 40i64)).unwrap();
        dispatcher.dispatch(&channel, request("IMath", "add", args));

        let (txn, body) = read_response(&mut peer).await;
        assert_eq!(txn, 42);
        let bytes = body.into_result().unwrap();
        assert_eq!(RpcCodec::default().deserialize::<i64>(&bytes).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unknown_method_answers_service_not_found() {
        let (dispatcher, channel, mut peer) = setup().await;
        dispatcher.dispatch(&channel, request("IMath", "mul", b"[1,2]".to_vec()));

        let (_, body) = read_response(&mut peer).await;
        match body {
            ResponseBody::Error(msg) => assert!(msg.contains("IMath#mul"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_names_are_bad_requests() {
        let (dispatcher, channel, mut peer) = setup().await;
        dispatcher.dispatch(&channel, request("", "add", Vec::new()));

        let (_, body) = read_response(&mut peer).await;
        assert!(matches!(body, ResponseBody::Error(msg) if msg.contains("Bad request")));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_response() {
        let (dispatcher, channel, mut peer) = setup().await;
        let args = RpcCodec::default().serialize(&()).unwrap();
        dispatcher.dispatch(&channel, request("IMath", "explode", args));

        let (_, body) = read_response(&mut peer).await;
        assert!(matches!(body, ResponseBody::Error(msg) if msg.contains("kaboom")));
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_a_busy_pool() {
        use crate::streaming::{cancel_service, StreamState, CANCEL_METHOD, STREAMING_SERVICE};

        let registry = Arc::new(ServiceRegistry::new());
        registry.add_service(cancel_service()).unwrap();
        registry
            .add_service(ServiceDefinition::new("IWork").method(MethodDefinition::unary(
                "hold",
                |(ms,): (u64,)| {
                    std::thread::sleep(std::time::Duration::from_millis(ms));
                    Ok(ms)
                },
            )))
            .unwrap();
        let streams = Arc::new(StreamingContextTable::new());
        let dispatcher = Dispatcher::new(registry, DispatchExecutor::worker_pool(1), streams.clone());
        let (_, channel, _peer) = setup().await;

        let context = streams.open(channel.clone(), 5, SerializationFormat::Json);
        let hold = RpcCodec::default().serialize(&(300u64,)).unwrap();
        dispatcher.dispatch(&channel, request("IWork", "hold", hold));

        let args = RpcCodec::default().serialize(&(5u64,)).unwrap();
        let cancel = Message::request(
            77,
            true,
            SerializationFormat::Json,
            STREAMING_SERVICE,
            CANCEL_METHOD,
            Headers::new(),
            Bytes::from(args),
        );
        dispatcher.dispatch(&channel, cancel);

        assert_eq!(context.state(), StreamState::Cancelled);
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_arguments_are_reported() {
        let (dispatcher, channel, mut peer) = setup().await;
        dispatcher.dispatch(&channel, request("IMath", "add", b"\"oops\"".to_vec()));

        let (_, body) = read_response(&mut peer).await;
        assert!(matches!(body, ResponseBody::Error(msg) if msg.contains("cannot decode arguments")));
    }
}
