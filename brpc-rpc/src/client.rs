//! RPC client: one lazily (re)connected channel to a server

use async_trait::async_trait;
use brpc_config::{AppConfig, BrpcConfig, ClientSettings};
use brpc_core::{DispatchExecutor, Error, ExecutorKind, Result};
use brpc_net::{Channel, ChannelConfig, ChannelStatsSnapshot, FrameHandler, TcpConfig};
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::SerializationFormat;
use crate::invocation::ChannelProvider;
use crate::registry::{ServiceDefinition, ServiceRegistry};
use crate::runtime::{channel_config, MessageHandler, RpcRuntime};
use crate::stub::ServiceStub;

type Resolver = Arc<dyn Fn() -> Result<SocketAddr> + Send + Sync>;

/// Where the client connects to, resolved on every connection attempt
#[derive(Clone)]
pub enum EndpointProvider {
    Static(SocketAddr),
    /// `host:port`, looked up through DNS
    Host(String),
    Dynamic(Resolver),
}

impl EndpointProvider {
    pub fn fixed(addr: SocketAddr) -> Self {
        EndpointProvider::Static(addr)
    }

    pub fn from_fn<F>(resolve: F) -> Self
    where
        F: Fn() -> Result<SocketAddr> + Send + Sync + 'static,
    {
        EndpointProvider::Dynamic(Arc::new(resolve))
    }

    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            EndpointProvider::Static(addr) => Ok(*addr),
            EndpointProvider::Host(host) => tokio::net::lookup_host(host.as_str())
                .await?
                .next()
                .ok_or_else(|| Error::CallerSide(format!("no address found for {}", host))),
            EndpointProvider::Dynamic(resolve) => resolve(),
        }
    }
}

impl fmt::Debug for EndpointProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointProvider::Static(addr) => write!(f, "Static({})", addr),
            EndpointProvider::Host(host) => write!(f, "Host({})", host),
            EndpointProvider::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<SocketAddr> for EndpointProvider {
    fn from(addr: SocketAddr) -> Self {
        EndpointProvider::Static(addr)
    }
}

/// RPC client configuration
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub endpoint: EndpointProvider,
    /// Announced to the server in the `appName` header; empty stays anonymous
    pub app_name: String,
    pub connect_timeout: Duration,
    /// Connection attempts before `connect` gives up
    pub max_retry: u32,
    pub retry_interval: Duration,
    /// Default timeout of stubs created by this client
    pub request_timeout: Duration,
    pub serializer: SerializationFormat,
    /// Executor for requests the server sends back over this connection
    pub executor: ExecutorKind,
    pub workers: usize,
    pub nodelay: bool,
    pub channel: ChannelConfig,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointProvider::Static(SocketAddr::from(([127, 0, 0, 1], 9090))),
            app_name: String::new(),
            connect_timeout: Duration::from_secs(3),
            max_retry: 3,
            retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            serializer: SerializationFormat::Json,
            executor: ExecutorKind::WorkerPool,
            workers: 0,
            nodelay: true,
            channel: ChannelConfig::default(),
        }
    }
}

impl RpcClientConfig {
    pub fn from_settings(app: &AppConfig, settings: &ClientSettings) -> Result<Self> {
        let endpoint = match settings.server_address.parse::<SocketAddr>() {
            Ok(addr) => EndpointProvider::Static(addr),
            Err(_) => EndpointProvider::Host(settings.server_address.clone()),
        };
        Ok(Self {
            endpoint,
            app_name: app.name.clone(),
            connect_timeout: settings.connect_timeout(),
            max_retry: settings.max_retry,
            retry_interval: settings.retry_interval(),
            request_timeout: settings.request_timeout(),
            serializer: settings.serializer.parse()?,
            executor: settings.executor.parse()?,
            workers: settings.workers,
            nodelay: settings.channel.nodelay,
            channel: channel_config(&settings.channel),
        })
    }

    pub fn from_config(config: &BrpcConfig) -> Result<Self> {
        Self::from_settings(&config.app, &config.client)
    }

    fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            connect_timeout: self.connect_timeout,
            nodelay: self.nodelay,
            channel: self.channel.clone(),
        }
    }
}

struct ClientShared {
    config: RpcClientConfig,
    runtime: Arc<RpcRuntime>,
    handler: Arc<dyn FrameHandler>,
    channel: RwLock<Option<Arc<Channel>>>,
    connect_lock: Mutex<()>,
}

impl ClientShared {
    fn current_channel(&self) -> Option<Arc<Channel>> {
        self.channel.read().as_ref().filter(|c| c.is_active()).cloned()
    }

    fn clear_channel(&self, channel_id: u64) {
        let mut slot = self.channel.write();
        if slot.as_ref().map(|c| c.id()) == Some(channel_id) {
            *slot = None;
            info!("Connection {} to server lost", channel_id);
        }
    }

    async fn connect_channel(&self) -> Result<Arc<Channel>> {
        let _guard = self.connect_lock.lock().await;
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }

        let tcp = self.config.tcp_config();
        let attempts = self.config.max_retry.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let connected = match self.config.endpoint.resolve().await {
                Ok(addr) => brpc_net::connect(addr, &tcp, self.handler.clone())
                    .await
                    .map_err(Error::from),
                Err(e) => Err(e),
            };
            match connected {
                Ok(channel) => {
                    *self.channel.write() = Some(channel.clone());
                    info!(
                        "Connected to {} as '{}' (attempt {})",
                        channel.peer_addr(),
                        self.config.app_name,
                        attempt
                    );
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(
                        "Connect to {:?} failed (attempt {}/{}): {}",
                        self.config.endpoint, attempt, attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                }
            }
        }

        Err(Error::CallerSide(format!(
            "cannot connect to {:?} after {} attempts: {}",
            self.config.endpoint, attempts, last_error
        )))
    }
}

#[async_trait]
impl ChannelProvider for ClientShared {
    async fn channel(&self) -> Result<Arc<Channel>> {
        match self.current_channel() {
            Some(channel) => Ok(channel),
            None => self.connect_channel().await,
        }
    }

    async fn reconnect(&self) -> Result<Arc<Channel>> {
        debug!("Reconnecting to {:?}", self.config.endpoint);
        self.connect_channel().await
    }

    fn current(&self) -> Option<Arc<Channel>> {
        self.current_channel()
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.get_mut().take() {
            channel.close();
        }
    }
}

/// RPC client
///
/// Cloning is cheap; clones and the stubs they hand out share one connection.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<ClientShared>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(ServiceRegistry::new()))
    }

    /// Client that also serves `registry` to requests sent by the server
    pub fn with_registry(config: RpcClientConfig, registry: Arc<ServiceRegistry>) -> Result<Self> {
        let executor = DispatchExecutor::from_kind(config.executor, config.workers);
        let runtime = RpcRuntime::new(registry, executor, config.serializer)?;

        let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
            let owner = weak.clone();
            let handler = MessageHandler::new(runtime.clone()).on_channel_closed(move |channel| {
                if let Some(shared) = owner.upgrade() {
                    shared.clear_channel(channel.id());
                }
            });
            ClientShared {
                config,
                runtime,
                handler: Arc::new(handler),
                channel: RwLock::new(None),
                connect_lock: Mutex::new(()),
            }
        });
        Ok(Self { shared })
    }

    pub fn builder() -> RpcClientBuilder {
        RpcClientBuilder::new()
    }

    /// Connect now instead of on the first call
    pub async fn connect(&self) -> Result<()> {
        self.shared.channel().await.map(|_| ())
    }

    /// Flush queued requests and close the connection
    pub async fn disconnect(&self) -> Result<()> {
        let Some(channel) = self.shared.channel.write().take() else {
            return Ok(());
        };
        info!("Disconnecting from {}", channel.peer_addr());

        if tokio::time::timeout(self.shared.config.connect_timeout, channel.flush())
            .await
            .is_err()
        {
            warn!(
                "Dropping {} unflushed bytes to {}",
                channel.pending_bytes(),
                channel.peer_addr()
            );
        }
        channel.close();
        channel.closed().await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current_channel().is_some()
    }

    /// Time since the current connection was established
    pub fn connection_age(&self) -> Option<Duration> {
        self.shared.current_channel().map(|c| c.age())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.current_channel().map(|c| c.peer_addr())
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.shared.current_channel()
    }

    pub fn channel_stats(&self) -> Option<ChannelStatsSnapshot> {
        self.shared.current_channel().map(|c| c.stats())
    }

    /// Stub for calling `interface` on the server
    pub fn stub(&self, interface: impl Into<String>) -> ServiceStub {
        ServiceStub::new(
            interface,
            self.shared.config.app_name.clone(),
            self.shared.clone(),
            self.shared.runtime.invocations().clone(),
            self.shared.config.request_timeout,
        )
    }

    /// Calls waiting for their response
    pub fn pending_request_count(&self) -> usize {
        self.shared.runtime.invocations().pending_request_count()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.shared.runtime.registry()
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.shared.config
    }
}

/// RPC client builder for easier configuration
pub struct RpcClientBuilder {
    config: RpcClientConfig,
    services: Vec<ServiceDefinition>,
}

impl RpcClientBuilder {
    pub fn new() -> Self {
        Self {
            config: RpcClientConfig::default(),
            services: Vec::new(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<EndpointProvider>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn max_retry(mut self, attempts: u32) -> Self {
        self.config.max_retry = attempts;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn serializer(mut self, format: SerializationFormat) -> Self {
        self.config.serializer = format;
        self
    }

    pub fn executor(mut self, kind: ExecutorKind, workers: usize) -> Self {
        self.config.executor = kind;
        self.config.workers = workers;
        self
    }

    /// Serve `definition` to requests initiated by the server
    pub fn service(mut self, definition: ServiceDefinition) -> Self {
        self.services.push(definition);
        self
    }

    pub fn build(self) -> Result<RpcClient> {
        let registry = Arc::new(ServiceRegistry::new());
        for definition in self.services {
            registry.add_service(definition)?;
        }
        RpcClient::with_registry(self.config, registry)
    }
}

impl Default for RpcClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
