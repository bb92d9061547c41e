//! TCP connect and accept helpers producing framed channels

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelConfig, FrameHandler};

#[derive(Error, Debug)]
pub enum TcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type TcpResult<T> = Result<T, TcpError>;

impl From<TcpError> for brpc_core::Error {
    fn from(err: TcpError) -> Self {
        match err {
            TcpError::Io(e) => brpc_core::Error::from(e),
            TcpError::Connection(msg) | TcpError::Timeout(msg) => brpc_core::Error::Channel(msg),
        }
    }
}

/// TCP connection configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    pub nodelay: bool,
    pub channel: ChannelConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            nodelay: true,
            channel: ChannelConfig::default(),
        }
    }
}

/// Open a connection and start its channel tasks
pub async fn connect(
    addr: SocketAddr,
    config: &TcpConfig,
    handler: Arc<dyn FrameHandler>,
) -> TcpResult<Arc<Channel>> {
    let start_time = Instant::now();

    let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            TcpError::Timeout(format!(
                "connect to {} timed out after {:?}",
                addr, config.connect_timeout
            ))
        })??;
    stream.set_nodelay(config.nodelay)?;

    let channel = Channel::spawn(stream, config.channel.clone(), handler)?;
    info!(
        "Channel {} established: {} -> {} (took {:?})",
        channel.id(),
        channel.local_addr(),
        channel.peer_addr(),
        start_time.elapsed()
    );
    Ok(channel)
}

#[derive(Debug, Default)]
struct AcceptorStats {
    total_connections: AtomicU64,
}

/// Snapshot of acceptor statistics
#[derive(Debug, Clone)]
pub struct AcceptorStatsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
}

/// Listening socket that turns accepted connections into channels
pub struct TcpAcceptor {
    inner: TcpListener,
    config: TcpConfig,
    channels: DashMap<u64, Arc<Channel>>,
    stats: AcceptorStats,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> TcpResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP acceptor bound to {}", listener.local_addr()?);

        Ok(Self {
            inner: listener,
            config,
            channels: DashMap::new(),
            stats: AcceptorStats::default(),
        })
    }

    /// Accept the next connection; the handler receives its frames
    pub async fn accept(&self, handler: Arc<dyn FrameHandler>) -> TcpResult<Arc<Channel>> {
        let (stream, peer_addr) = self.inner.accept().await?;
        stream.set_nodelay(self.config.nodelay)?;

        let channel = Channel::spawn(stream, self.config.channel.clone(), handler)?;
        self.channels.retain(|_, c| c.is_active());
        self.channels.insert(channel.id(), channel.clone());
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        info!("Accepted channel {} from {}", channel.id(), peer_addr);
        Ok(channel)
    }

    pub fn local_addr(&self) -> TcpResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn active_connections(&self) -> usize {
        self.channels.retain(|_, c| c.is_active());
        self.channels.len()
    }

    /// Close every channel accepted so far
    pub fn close_all(&self) {
        for entry in self.channels.iter() {
            entry.value().close();
        }
        debug!("Closed {} accepted channels", self.channels.len());
        self.channels.clear();
    }

    pub fn stats(&self) -> AcceptorStatsSnapshot {
        AcceptorStatsSnapshot {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
        }
    }
}
