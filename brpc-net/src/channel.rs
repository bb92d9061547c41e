//! TCP channel with a reader task, a writer task and writability tracking
//!
//! Outbound frames are queued on an unbounded queue drained by the writer
//! task. Queued bytes are counted against a high/low water mark pair: above
//! the high mark the channel reports not writable and the reader task stops
//! reading inbound bytes until the writer has drained below the low mark.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use brpc_core::{Error, Result};

use crate::frame::{FrameDecoder, DEFAULT_MAX_FRAME_LENGTH};

static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-channel buffering configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Queued outbound bytes above which the channel is not writable
    pub high_water_mark: usize,
    /// Queued outbound bytes at or below which the channel is writable again
    pub low_water_mark: usize,
    pub read_buffer_size: usize,
    pub max_frame_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 64 * 1024,
            low_water_mark: 32 * 1024,
            read_buffer_size: 8 * 1024,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Receives decoded frames and the close event of a channel.
///
/// Called from the channel's reader task, so implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, channel: &Arc<Channel>, frame: Bytes);

    /// Called exactly once, after the channel became inactive
    fn on_close(&self, _channel: &Arc<Channel>) {}
}

#[derive(Debug, Default)]
struct ChannelStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    read_suspensions: AtomicU64,
    write_errors: AtomicU64,
}

/// Snapshot of channel statistics
#[derive(Debug, Clone)]
pub struct ChannelStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub read_suspensions: u64,
    pub write_errors: u64,
    pub pending_bytes: usize,
    pub uptime: Duration,
}

impl ChannelStatsSnapshot {
    pub fn throughput_sent(&self) -> f64 {
        if self.uptime.as_secs_f64() > 0.0 {
            self.bytes_sent as f64 / self.uptime.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn throughput_received(&self) -> f64 {
        if self.uptime.as_secs_f64() > 0.0 {
            self.bytes_received as f64 / self.uptime.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// One framed TCP connection
pub struct Channel {
    id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connected_at: Instant,
    config: ChannelConfig,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending_bytes: AtomicUsize,
    writable: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    drained: Notify,
    stats: ChannelStats,
}

impl Channel {
    /// Wrap a connected stream and start its reader and writer tasks
    pub fn spawn(
        stream: TcpStream,
        config: ChannelConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> std::io::Result<Arc<Channel>> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (writable, writable_rx) = watch::channel(true);
        let (closed, closed_rx) = watch::channel(false);

        let channel = Arc::new(Channel {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            peer_addr,
            connected_at: Instant::now(),
            config,
            outbound,
            pending_bytes: AtomicUsize::new(0),
            writable,
            closed,
            drained: Notify::new(),
            stats: ChannelStats::default(),
        });

        tokio::spawn(write_loop(
            channel.clone(),
            outbound_rx,
            writer,
            closed_rx.clone(),
        ));
        tokio::spawn(read_loop(
            channel.clone(),
            reader,
            handler,
            closed_rx,
            writable_rx,
        ));

        Ok(channel)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Time since the connection was established
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        !*self.closed.borrow()
    }

    pub fn is_writable(&self) -> bool {
        self.is_active() && *self.writable.borrow()
    }

    /// Outbound bytes queued but not yet written to the socket
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// Queue an already framed buffer for writing. Never waits.
    pub fn write(&self, frame: Bytes) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Channel(format!(
                "channel {} to {} is not active",
                self.id, self.peer_addr
            )));
        }

        let len = frame.len();
        self.pending_bytes.fetch_add(len, Ordering::AcqRel);
        self.update_writability();

        if self.outbound.send(frame).is_err() {
            self.release(len);
            return Err(Error::Channel(format!(
                "channel {} to {} is closed",
                self.id, self.peer_addr
            )));
        }
        Ok(())
    }

    /// Mark the channel inactive; queued frames are still flushed by the writer
    pub fn close(&self) {
        let was_open = !self.closed.send_replace(true);
        if was_open {
            info!("Closed channel {} ({} -> {})", self.id, self.local_addr, self.peer_addr);
            self.drained.notify_waiters();
        }
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait until every queued frame was handed to the socket or the channel closed
    pub async fn flush(&self) {
        loop {
            let drained = self.drained.notified();
            if self.pending_bytes() == 0 || !self.is_active() {
                return;
            }
            drained.await;
        }
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            read_suspensions: self.stats.read_suspensions.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
            pending_bytes: self.pending_bytes(),
            uptime: self.age(),
        }
    }

    fn release(&self, len: usize) {
        let remaining = self.pending_bytes.fetch_sub(len, Ordering::AcqRel) - len;
        self.update_writability();
        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }

    // Evaluated under the watch lock so concurrent producers and the writer
    // agree on the transition.
    fn update_writability(&self) {
        let high = self.config.high_water_mark;
        let low = self.config.low_water_mark;
        let pending = &self.pending_bytes;
        let id = self.id;
        self.writable.send_if_modified(|writable| {
            let queued = pending.load(Ordering::Acquire);
            if *writable && queued > high {
                debug!("Channel {} not writable ({} bytes queued)", id, queued);
                *writable = false;
                true
            } else if !*writable && queued <= low {
                debug!("Channel {} writable again ({} bytes queued)", id, queued);
                *writable = true;
                true
            } else {
                false
            }
        });
    }

    async fn write_out(&self, writer: &mut OwnedWriteHalf, frame: Bytes) -> std::io::Result<()> {
        let len = frame.len();
        let result = writer.write_all(&frame).await;
        self.release(len);
        result?;
        self.stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.is_active())
            .field("writable", &self.is_writable())
            .finish()
    }
}

async fn write_loop(
    channel: Arc<Channel>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut writer: OwnedWriteHalf,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = channel.write_out(&mut writer, frame).await {
                    channel.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Write to {} failed on channel {}: {}", channel.peer_addr, channel.id, e);
                    channel.close();
                    break;
                }
            }
            _ = closed.changed() => {
                while let Ok(frame) = outbound.try_recv() {
                    if channel.write_out(&mut writer, frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    // Frames still queued after a failed write are never sent
    while let Ok(frame) = outbound.try_recv() {
        channel.release(frame.len());
    }
    let _ = writer.shutdown().await;
    trace!("Writer task of channel {} finished", channel.id);
}

async fn read_loop(
    channel: Arc<Channel>,
    mut reader: OwnedReadHalf,
    handler: Arc<dyn FrameHandler>,
    mut closed: watch::Receiver<bool>,
    mut writable: watch::Receiver<bool>,
) {
    let read_buffer_size = channel.config.read_buffer_size.max(64);
    let mut buf = BytesMut::with_capacity(read_buffer_size);
    let mut decoder = FrameDecoder::new(channel.config.max_frame_length);

    'read: loop {
        if *closed.borrow_and_update() {
            break;
        }

        if !*writable.borrow_and_update() {
            channel.stats.read_suspensions.fetch_add(1, Ordering::Relaxed);
            trace!("Suspending reads on channel {}", channel.id);
            tokio::select! {
                changed = writable.changed() => if changed.is_err() { break },
                _ = closed.changed() => break,
            }
            continue;
        }

        if buf.capacity() - buf.len() < read_buffer_size / 2 {
            buf.reserve(read_buffer_size);
        }

        tokio::select! {
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    debug!("Peer {} closed channel {}", channel.peer_addr, channel.id);
                    break;
                }
                Ok(n) => {
                    channel.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    loop {
                        match decoder.decode(&mut buf) {
                            Ok(Some(frame)) => {
                                channel.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                                handler.on_frame(&channel, frame);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Closing channel {} from {}: {}", channel.id, channel.peer_addr, e);
                                break 'read;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Read from {} failed on channel {}: {}", channel.peer_addr, channel.id, e);
                    break;
                }
            },
            _ = closed.changed() => break,
            _ = writable.changed() => {}
        }
    }

    channel.close();
    handler.on_close(&channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use tokio::net::TcpListener;

    struct Collect {
        frames: mpsc::UnboundedSender<Bytes>,
        closes: mpsc::UnboundedSender<u64>,
    }

    impl FrameHandler for Collect {
        fn on_frame(&self, _channel: &Arc<Channel>, frame: Bytes) {
            let _ = self.frames.send(frame);
        }

        fn on_close(&self, channel: &Arc<Channel>) {
            let _ = self.closes.send(channel.id());
        }
    }

    fn collector() -> (
        Arc<Collect>,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedReceiver<u64>,
    ) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (closes, closes_rx) = mpsc::unbounded_channel();
        (Arc::new(Collect { frames, closes }), frames_rx, closes_rx)
    }

    async fn connected_pair(config: ChannelConfig) -> (Arc<Channel>, TcpStream, mpsc::UnboundedReceiver<Bytes>, mpsc::UnboundedReceiver<u64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (handler, frames, closes) = collector();
        let channel = Channel::spawn(client.unwrap(), config, handler).unwrap();
        (channel, accepted.unwrap().0, frames, closes)
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (channel, mut peer, mut frames, _closes) = connected_pair(ChannelConfig::default()).await;

        channel.write(encode_frame(b"ping").unwrap()).unwrap();
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\0\0\0\x04ping");

        peer.write_all(&encode_frame(b"pong").unwrap()).await.unwrap();
        assert_eq!(frames.recv().await.unwrap(), Bytes::from_static(b"pong"));

        channel.flush().await;
        let stats = channel.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.bytes_sent, 8);
        assert_eq!(stats.pending_bytes, 0);
    }

    #[tokio::test]
    async fn test_peer_close_fires_on_close_once() {
        let (channel, peer, _frames, mut closes) = connected_pair(ChannelConfig::default()).await;
        drop(peer);

        assert_eq!(closes.recv().await, Some(channel.id()));
        assert!(!channel.is_active());
        assert!(channel.write(Bytes::from_static(b"x")).is_err());
        channel.close();
        assert!(tokio::time::timeout(Duration::from_millis(50), closes.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_channel() {
        let config = ChannelConfig {
            max_frame_length: 16,
            ..ChannelConfig::default()
        };
        let (channel, mut peer, mut frames, mut closes) = connected_pair(config).await;

        peer.write_all(&encode_frame(&[7u8; 32]).unwrap()).await.unwrap();
        assert_eq!(closes.recv().await, Some(channel.id()));
        assert!(frames.try_recv().is_err());
        channel.closed().await;
    }

    #[tokio::test]
    async fn test_writability_follows_water_marks() {
        let config = ChannelConfig {
            high_water_mark: 64 * 1024,
            low_water_mark: 16 * 1024,
            ..ChannelConfig::default()
        };
        let (channel, mut peer, _frames, _closes) = connected_pair(config).await;
        assert!(channel.is_writable());

        let chunk = Bytes::from(vec![0u8; 64 * 1024]);
        for _ in 0..128 {
            channel.write(chunk.clone()).unwrap();
        }
        assert!(!channel.is_writable());

        let drain = tokio::spawn(async move {
            let mut sink = vec![0u8; 64 * 1024];
            let mut total = 0usize;
            while total < 128 * 64 * 1024 {
                let n = peer.read(&mut sink).await.unwrap();
                assert!(n > 0);
                total += n;
            }
            peer
        });

        tokio::time::timeout(Duration::from_secs(10), channel.flush()).await.unwrap();
        assert!(channel.is_writable());
        let _peer = drain.await.unwrap();
    }
}
