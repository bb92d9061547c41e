//! Service registry
//!
//! Services are described by hand: a [`ServiceDefinition`] lists one
//! [`MethodDefinition`] per exposed method, each wrapping a typed closure
//! over the implementation. Callers describe the same methods with
//! [`MethodDescriptor`] constants.

use brpc_core::{Error, Result};
use brpc_net::Channel;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

use crate::codec::{RpcCodec, SerializationFormat};
use crate::protocol::{Headers, TransactionId};
use crate::streaming::{StreamSink, StreamingContext, StreamingContextTable};

/// Call shape of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    Oneway,
    Streaming,
}

/// Caller-side description of a remote method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Interface the method belongs to; the default service name
    pub interface: &'static str,
    pub method: &'static str,
    pub service_name: Option<&'static str>,
    pub alias: Option<&'static str>,
    pub kind: MethodKind,
    /// `None` uses the invocation manager's default serializer
    pub serializer: Option<SerializationFormat>,
}

impl MethodDescriptor {
    const fn new(interface: &'static str, method: &'static str, kind: MethodKind) -> Self {
        Self {
            interface,
            method,
            service_name: None,
            alias: None,
            kind,
            serializer: None,
        }
    }

    pub const fn unary(interface: &'static str, method: &'static str) -> Self {
        Self::new(interface, method, MethodKind::Unary)
    }

    pub const fn oneway(interface: &'static str, method: &'static str) -> Self {
        Self::new(interface, method, MethodKind::Oneway)
    }

    pub const fn streaming(interface: &'static str, method: &'static str) -> Self {
        Self::new(interface, method, MethodKind::Streaming)
    }

    pub const fn with_alias(self, alias: &'static str) -> Self {
        Self {
            alias: Some(alias),
            ..self
        }
    }

    pub const fn with_service_name(self, service_name: &'static str) -> Self {
        Self {
            service_name: Some(service_name),
            ..self
        }
    }

    pub const fn with_serializer(self, serializer: SerializationFormat) -> Self {
        Self {
            serializer: Some(serializer),
            ..self
        }
    }
}

/// Wire routing data derived once from a [`MethodDescriptor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistryItem {
    pub service_name: String,
    pub method_name: String,
    pub is_oneway: bool,
    pub is_streaming: bool,
    pub serializer: SerializationFormat,
}

impl ServiceRegistryItem {
    pub fn from_descriptor(descriptor: &MethodDescriptor, default_serializer: SerializationFormat) -> Self {
        Self {
            service_name: descriptor.service_name.unwrap_or(descriptor.interface).to_string(),
            method_name: descriptor.alias.unwrap_or(descriptor.method).to_string(),
            is_oneway: descriptor.kind == MethodKind::Oneway,
            is_streaming: descriptor.kind == MethodKind::Streaming,
            serializer: descriptor.serializer.unwrap_or(default_serializer),
        }
    }
}

/// What an invoker sees of the request it executes
pub struct CallContext {
    pub channel: Arc<Channel>,
    pub transaction_id: TransactionId,
    pub codec: RpcCodec,
    pub headers: Headers,
    /// Present for streaming methods
    pub stream: Option<Arc<StreamingContext>>,
    pub streams: Arc<StreamingContextTable>,
}

/// Executes one registered method
pub trait ServiceInvoker: Send + Sync {
    /// Run the method on serialized arguments; unary methods return the
    /// serialized result
    fn invoke(&self, ctx: &CallContext, args: &[u8]) -> Result<Option<Vec<u8>>>;

    fn is_oneway(&self) -> bool {
        false
    }

    fn is_streaming(&self) -> bool {
        false
    }

    /// Run on the connection's reader task instead of the dispatch
    /// executor. Only for short, non-blocking control methods.
    fn runs_inline(&self) -> bool {
        false
    }

    /// Type name of the argument tuple
    fn parameter_types(&self) -> &'static str;
}

fn decode_args<A: DeserializeOwned>(ctx: &CallContext, args: &[u8]) -> Result<A> {
    ctx.codec
        .deserialize(args)
        .map_err(|e| Error::BadRequest(format!("cannot decode arguments: {}", e)))
}

struct UnaryInvoker<A, R, F> {
    handler: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R, F> ServiceInvoker for UnaryInvoker<A, R, F>
where
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(A) -> Result<R> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &CallContext, args: &[u8]) -> Result<Option<Vec<u8>>> {
        let args = decode_args(ctx, args)?;
        let value = (self.handler)(args)?;
        ctx.codec.serialize(&value).map(Some)
    }

    fn parameter_types(&self) -> &'static str {
        std::any::type_name::<A>()
    }
}

struct OnewayInvoker<A, F> {
    handler: F,
    _marker: PhantomData<fn(A)>,
}

impl<A, F> ServiceInvoker for OnewayInvoker<A, F>
where
    A: DeserializeOwned + 'static,
    F: Fn(A) -> Result<()> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &CallContext, args: &[u8]) -> Result<Option<Vec<u8>>> {
        let args = decode_args(ctx, args)?;
        (self.handler)(args)?;
        Ok(None)
    }

    fn is_oneway(&self) -> bool {
        true
    }

    fn parameter_types(&self) -> &'static str {
        std::any::type_name::<A>()
    }
}

struct StreamingInvoker<A, T, F> {
    handler: F,
    _marker: PhantomData<fn(A, T)>,
}

impl<A, T, F> ServiceInvoker for StreamingInvoker<A, T, F>
where
    A: DeserializeOwned + 'static,
    T: Serialize + 'static,
    F: Fn(A, StreamSink<T>) -> Result<()> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &CallContext, args: &[u8]) -> Result<Option<Vec<u8>>> {
        let stream = ctx.stream.clone().ok_or_else(|| {
            Error::ServiceInvocation("streaming method invoked without a stream".to_string())
        })?;
        let args = decode_args(ctx, args)?;
        (self.handler)(args, StreamSink::new(stream))?;
        Ok(None)
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn parameter_types(&self) -> &'static str {
        std::any::type_name::<A>()
    }
}

/// One method of a service definition
pub struct MethodDefinition {
    name: String,
    alias: Option<String>,
    invoker: Arc<dyn ServiceInvoker>,
}

impl MethodDefinition {
    /// Request/response method. Arguments arrive as a tuple, e.g. `(String,)`.
    pub fn unary<A, R, F>(name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        Self::from_invoker(
            name,
            Arc::new(UnaryInvoker {
                handler,
                _marker: PhantomData,
            }),
        )
    }

    /// Fire-and-forget method; the caller never waits for it
    pub fn oneway<A, F>(name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_invoker(
            name,
            Arc::new(OnewayInvoker {
                handler,
                _marker: PhantomData,
            }),
        )
    }

    /// Server-push method. The sink is injected; only `A` travels on the wire.
    pub fn streaming<A, T, F>(name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        T: Serialize + 'static,
        F: Fn(A, StreamSink<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_invoker(
            name,
            Arc::new(StreamingInvoker {
                handler,
                _marker: PhantomData,
            }),
        )
    }

    pub fn from_invoker(name: impl Into<String>, invoker: Arc<dyn ServiceInvoker>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            invoker,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name used on the wire
    pub fn exposed_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn invoker(&self) -> &Arc<dyn ServiceInvoker> {
        &self.invoker
    }
}

/// A service and its methods
pub struct ServiceDefinition {
    name: String,
    description: String,
    methods: Vec<MethodDefinition>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn method(mut self, method: MethodDefinition) -> Self {
        self.methods.push(method);
        self
    }

    pub fn add_method(&mut self, method: MethodDefinition) {
        self.methods.push(method);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.iter().map(|m| m.exposed_name()).collect()
    }
}

type MethodTable = HashMap<String, Arc<dyn ServiceInvoker>>;

/// `(service, method)` to invoker lookup shared by every connection of an endpoint
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<MethodTable>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; registering a name again replaces its methods
    pub fn add_service(&self, definition: ServiceDefinition) -> Result<()> {
        let mut methods = MethodTable::with_capacity(definition.methods.len());
        for method in definition.methods {
            let exposed = method.exposed_name().to_string();
            if methods.contains_key(&exposed) {
                return Err(Error::Configuration(format!(
                    "method '{}' is defined more than once in service '{}'; give one of them an alias",
                    exposed, definition.name
                )));
            }
            methods.insert(exposed, method.invoker);
        }

        let count = methods.len();
        let replaced = self
            .services
            .insert(definition.name.clone(), Arc::new(methods))
            .is_some();
        if replaced {
            info!("Replaced RPC service {} ({} methods)", definition.name, count);
        } else {
            info!("Registered RPC service {} ({} methods)", definition.name, count);
        }
        Ok(())
    }

    pub fn remove_service(&self, service: &str) -> bool {
        self.services.remove(service).is_some()
    }

    pub fn find_invoker(&self, service: &str, method: &str) -> Option<Arc<dyn ServiceInvoker>> {
        let methods = self.services.get(service)?.value().clone();
        methods.get(method).cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
