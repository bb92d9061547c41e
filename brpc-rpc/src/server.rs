//! RPC server: accept loop, shared message handler and sessions

use brpc_config::{AppConfig, BrpcConfig, ServerSettings};
use brpc_core::{DispatchExecutor, Error, ExecutorKind, Result};
use brpc_net::{AcceptorStatsSnapshot, ChannelConfig, FrameHandler, TcpAcceptor, TcpConfig};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::SerializationFormat;
use crate::invocation::FixedChannel;
use crate::registry::{ServiceDefinition, ServiceRegistry};
use crate::runtime::{channel_config, MessageHandler, RpcRuntime};
use crate::session::{Session, SessionManager};
use crate::stub::ServiceStub;

/// RPC server configuration
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub bind_address: SocketAddr,
    /// Announced in the `appName` header of calls made through session stubs
    pub app_name: String,
    /// Default timeout of stubs towards connected clients
    pub request_timeout: Duration,
    pub serializer: SerializationFormat,
    pub executor: ExecutorKind,
    /// Worker pool size, 0 = available parallelism
    pub workers: usize,
    pub nodelay: bool,
    pub channel: ChannelConfig,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
            app_name: String::new(),
            request_timeout: Duration::from_secs(30),
            serializer: SerializationFormat::Json,
            executor: ExecutorKind::WorkerPool,
            workers: 0,
            nodelay: true,
            channel: ChannelConfig::default(),
        }
    }
}

impl RpcServerConfig {
    pub fn from_settings(app: &AppConfig, settings: &ServerSettings) -> Result<Self> {
        let bind_address = settings.bind_address.parse().map_err(|_| {
            Error::Configuration(format!("Invalid bind address '{}'", settings.bind_address))
        })?;
        Ok(Self {
            bind_address,
            app_name: app.name.clone(),
            request_timeout: settings.request_timeout(),
            serializer: settings.serializer.parse()?,
            executor: settings.executor.parse()?,
            workers: settings.workers,
            nodelay: settings.channel.nodelay,
            channel: channel_config(&settings.channel),
        })
    }

    pub fn from_config(config: &BrpcConfig) -> Result<Self> {
        Self::from_settings(&config.app, &config.server)
    }
}

/// RPC server
pub struct RpcServer {
    config: RpcServerConfig,
    runtime: Arc<RpcRuntime>,
    sessions: Arc<SessionManager>,
    acceptor: Arc<TcpAcceptor>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind and start accepting connections
    pub async fn start(config: RpcServerConfig, registry: Arc<ServiceRegistry>) -> Result<Self> {
        let executor = DispatchExecutor::from_kind(config.executor, config.workers);
        let runtime = RpcRuntime::new(registry, executor, config.serializer)?;
        let sessions = Arc::new(SessionManager::new());

        let tcp = TcpConfig {
            connect_timeout: Duration::from_secs(3),
            nodelay: config.nodelay,
            channel: config.channel.clone(),
        };
        let acceptor = Arc::new(TcpAcceptor::bind(config.bind_address, tcp).await?);
        let local_addr = acceptor.local_addr()?;

        let handler: Arc<dyn FrameHandler> =
            Arc::new(MessageHandler::new(runtime.clone()).with_sessions(sessions.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(acceptor.clone(), handler, shutdown_rx));

        info!(
            "RPC server listening on {} ({} services, {:?} executor)",
            local_addr,
            runtime.registry().len(),
            runtime.dispatcher().executor().kind()
        );

        Ok(Self {
            config,
            runtime,
            sessions,
            acceptor,
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.sessions()
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// One stub per connected instance of `app_name`, calling its `service`
    pub fn get_remote_services(&self, app_name: &str, service: &str) -> Vec<ServiceStub> {
        self.sessions
            .sessions_for(app_name)
            .into_iter()
            .map(|session| {
                ServiceStub::new(
                    service,
                    self.config.app_name.clone(),
                    Arc::new(FixedChannel::new(session.channel().clone())),
                    self.runtime.invocations().clone(),
                    self.config.request_timeout,
                )
            })
            .collect()
    }

    pub fn pending_request_count(&self) -> usize {
        self.runtime.invocations().pending_request_count()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.runtime.registry()
    }

    /// Server-side streams still emitting
    pub fn active_streams(&self) -> usize {
        self.runtime.streams().len()
    }

    pub fn stats(&self) -> AcceptorStatsSnapshot {
        self.acceptor.stats()
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept loop of {} ended abnormally: {}", self.local_addr, e);
            }
        }
        self.acceptor.close_all();
        info!("RPC server on {} shut down", self.local_addr);
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.acceptor.close_all();
    }
}

async fn accept_loop(
    acceptor: Arc<TcpAcceptor>,
    handler: Arc<dyn FrameHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = acceptor.accept(handler.clone()) => {
                if let Err(e) = accepted {
                    warn!("Failed to accept RPC connection: {}", e);
                    // Avoid spinning on persistent errors such as EMFILE
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

/// RPC server builder
pub struct RpcServerBuilder {
    config: RpcServerConfig,
    services: Vec<ServiceDefinition>,
}

impl RpcServerBuilder {
    pub fn new() -> Self {
        Self {
            config: RpcServerConfig::default(),
            services: Vec::new(),
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
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

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.config.channel = channel;
        self
    }

    pub fn service(mut self, definition: ServiceDefinition) -> Self {
        self.services.push(definition);
        self
    }

    pub async fn start(self) -> Result<RpcServer> {
        let registry = Arc::new(ServiceRegistry::new());
        for definition in self.services {
            registry.add_service(definition)?;
        }
        RpcServer::start(self.config, registry).await
    }
}

impl Default for RpcServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
