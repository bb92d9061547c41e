//! Server-side sessions of identified connections

use brpc_net::Channel;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::info;

use crate::protocol::{Headers, Message, APP_NAME_HEADER};

/// A connection whose peer announced its application name
#[derive(Debug)]
pub struct Session {
    channel: Arc<Channel>,
    remote_application_name: String,
    remote_attributes: Headers,
    connected_at: SystemTime,
    registered_at: Instant,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn remote_application_name(&self) -> &str {
        &self.remote_application_name
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Headers of the request that opened the session
    pub fn remote_attributes(&self) -> &Headers {
        &self.remote_attributes
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn age(&self) -> std::time::Duration {
        self.registered_at.elapsed()
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }
}

/// Sessions by channel id, indexed by application name
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<u64, Arc<Session>>,
    by_application: DashMap<String, Vec<u64>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for the channel on its first identified request
    pub fn on_request(&self, channel: &Arc<Channel>, request: &Message) -> Option<Arc<Session>> {
        let application = match request.headers.get(APP_NAME_HEADER) {
            Some(name) if !name.is_empty() => name,
            _ => return self.get(channel.id()),
        };

        let session = match self.sessions.entry(channel.id()) {
            Entry::Occupied(existing) => return Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                let session = Arc::new(Session {
                    channel: channel.clone(),
                    remote_application_name: application.to_string(),
                    remote_attributes: request.headers.clone(),
                    connected_at: SystemTime::now()
                        .checked_sub(channel.age())
                        .unwrap_or_else(SystemTime::now),
                    registered_at: Instant::now(),
                });
                slot.insert(session.clone());
                session
            }
        };

        self.by_application
            .entry(application.to_string())
            .or_default()
            .push(session.id());
        info!(
            "Session {} opened for application {} from {}",
            session.id(),
            application,
            session.remote_endpoint()
        );
        Some(session)
    }

    pub fn remove(&self, channel_id: u64) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&channel_id)?;
        let application = session.remote_application_name.clone();
        if let Some(mut ids) = self.by_application.get_mut(&application) {
            ids.retain(|id| *id != channel_id);
        }
        self.by_application.remove_if(&application, |_, ids| ids.is_empty());
        info!(
            "Session {} of application {} closed",
            channel_id, application
        );
        Some(session)
    }

    pub fn get(&self, channel_id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&channel_id).map(|s| s.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Live sessions of one application, one per connected instance
    pub fn sessions_for(&self, application: &str) -> Vec<Arc<Session>> {
        let ids = match self.by_application.get(application) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| self.get(id))
            .filter(|s| s.is_active())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SerializationFormat;
    use brpc_net::{ChannelConfig, FrameHandler};
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    struct Ignore;

    impl FrameHandler for Ignore {
        fn on_frame(&self, _channel: &Arc<Channel>, _frame: Bytes) {}
    }

    async fn accepted_channel() -> (Arc<Channel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let channel = Channel::spawn(accepted.unwrap().0, ChannelConfig::default(), Arc::new(Ignore)).unwrap();
        (channel, client.unwrap())
    }

    fn request_from(app: &str) -> Message {
        let headers: Headers = [(APP_NAME_HEADER, app), ("agentId", "a-1")].into_iter().collect();
        Message::request(1, false, SerializationFormat::Json, "IEcho", "echo", headers, Bytes::new())
    }

    #[tokio::test]
    async fn test_first_identified_request_opens_session() {
        let manager = SessionManager::new();
        let (channel, _peer) = accepted_channel().await;

        let session = manager.on_request(&channel, &request_from("collector")).unwrap();
        assert_eq!(session.remote_application_name(), "collector");
        assert_eq!(session.remote_attributes().get("agentId"), Some("a-1"));
        assert_eq!(session.local_endpoint(), channel.local_addr());

        let again = manager.on_request(&channel, &request_from("renamed")).unwrap();
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.sessions_for("collector").len(), 1);
        assert!(manager.sessions_for("renamed").is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_requests_open_nothing() {
        let manager = SessionManager::new();
        let (channel, _peer) = accepted_channel().await;
        assert!(manager.on_request(&channel, &request_from("")).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_remove_cleans_application_index() {
        let manager = SessionManager::new();
        let (a, _pa) = accepted_channel().await;
        let (b, _pb) = accepted_channel().await;
        manager.on_request(&a, &request_from("agent"));
        manager.on_request(&b, &request_from("agent"));
        assert_eq!(manager.sessions_for("agent").len(), 2);

        manager.remove(a.id());
        assert_eq!(manager.sessions_for("agent").len(), 1);
        manager.remove(b.id());
        assert!(manager.sessions_for("agent").is_empty());
        assert!(manager.by_application.is_empty());
    }
}
