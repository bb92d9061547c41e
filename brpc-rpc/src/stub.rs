//! Caller-side stubs
//!
//! Per-interface stubs are written by hand on top of [`ServiceStub`]:
//!
//! ```ignore
//! pub const ECHO: MethodDescriptor = MethodDescriptor::unary("IEcho", "echo");
//!
//! pub struct EchoStub(ServiceStub);
//!
//! impl EchoStub {
//!     pub async fn echo(&self, msg: &str) -> Result<String> {
//!         self.0.call(&ECHO, &(msg,)).await
//!     }
//! }
//! ```
//!
//! Stub settings (`set_debug`, `set_timeout`, `reset_timeout`) and the
//! connection queries (`peer_addr`, `channel`) are answered locally and
//! never reach the wire.

use brpc_core::{Error, Result};
use brpc_net::Channel;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::invocation::{CallOptions, ChannelProvider, InvocationManager};
use crate::protocol::{Headers, TransactionId};
use crate::registry::{MethodDescriptor, MethodKind};
use crate::streaming::{RemoteStream, CANCEL_STREAMING};

#[derive(Debug, Clone, Copy)]
struct StubSettings {
    timeout: Duration,
    debug: bool,
}

/// Shared invocation path of every stub
pub struct ServiceStub {
    interface: String,
    app_name: String,
    headers: Headers,
    default_timeout: Duration,
    settings: RwLock<StubSettings>,
    provider: Arc<dyn ChannelProvider>,
    invocations: Arc<InvocationManager>,
}

impl ServiceStub {
    pub fn new(
        interface: impl Into<String>,
        app_name: impl Into<String>,
        provider: Arc<dyn ChannelProvider>,
        invocations: Arc<InvocationManager>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            interface: interface.into(),
            app_name: app_name.into(),
            headers: Headers::new(),
            default_timeout,
            settings: RwLock::new(StubSettings {
                timeout: default_timeout,
                debug: false,
            }),
            provider,
            invocations,
        }
    }

    /// Header sent with every call of this stub
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn set_debug(&self, debug: bool) {
        self.settings.write().debug = debug;
    }

    pub fn is_debug(&self) -> bool {
        self.settings.read().debug
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.settings.write().timeout = timeout;
    }

    /// Back to the timeout the stub was created with
    pub fn reset_timeout(&self) {
        self.settings.write().timeout = self.default_timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.settings.read().timeout
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.provider.current().map(|c| c.peer_addr())
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.provider.current()
    }

    fn options(&self) -> CallOptions<'_> {
        let settings = *self.settings.read();
        CallOptions {
            app_name: &self.app_name,
            headers: &self.headers,
            timeout: settings.timeout,
            debug: settings.debug,
        }
    }

    /// Reject descriptors of another interface or of another call shape
    fn check(&self, descriptor: &MethodDescriptor, kind: MethodKind) -> Result<()> {
        if descriptor.interface != self.interface {
            return Err(Error::CallerSide(format!(
                "{}#{} does not belong to {}",
                descriptor.interface, descriptor.method, self.interface
            )));
        }
        if descriptor.kind != kind {
            return Err(Error::CallerSide(format!(
                "{}#{} is {:?}, not {:?}",
                descriptor.interface, descriptor.method, descriptor.kind, kind
            )));
        }
        Ok(())
    }

    /// Request/response call
    pub async fn call<A, R>(&self, descriptor: &MethodDescriptor, args: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.check(descriptor, MethodKind::Unary)?;
        self.invocations
            .invoke(&self.options(), self.provider.as_ref(), descriptor, args)
            .await?
            .ok_or_else(|| Error::Protocol(format!("no value returned by {}#{}", descriptor.interface, descriptor.method)))
    }

    /// Fire-and-forget call; returns once the request is written
    pub async fn call_oneway<A>(&self, descriptor: &MethodDescriptor, args: &A) -> Result<()>
    where
        A: Serialize + Sync + ?Sized,
    {
        self.check(descriptor, MethodKind::Oneway)?;
        self.invocations
            .invoke::<A, ()>(&self.options(), self.provider.as_ref(), descriptor, args)
            .await
            .map(|_| ())
    }

    /// Start a server-push stream
    pub async fn call_streaming<A, T>(&self, descriptor: &MethodDescriptor, args: &A) -> Result<RemoteStream<T>>
    where
        A: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.check(descriptor, MethodKind::Streaming)?;
        self.invocations
            .invoke_streaming(&self.options(), self.provider.as_ref(), descriptor, args)
            .await
    }

    /// Ask the callee to stop a stream and end it locally
    pub async fn cancel_streaming(&self, transaction_id: TransactionId) -> Result<()> {
        self.invocations.streams().finish(transaction_id);
        debug!("Cancelling stream {}", transaction_id);
        self.invocations
            .invoke::<_, ()>(&self.options(), self.provider.as_ref(), &CANCEL_STREAMING, &(transaction_id,))
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for ServiceStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStub")
            .field("interface", &self.interface)
            .field("app_name", &self.app_name)
            .field("peer_addr", &self.peer_addr())
            .field("timeout", &self.timeout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SerializationFormat;
    use async_trait::async_trait;

    struct Disconnected;

    #[async_trait]
    impl ChannelProvider for Disconnected {
        async fn channel(&self) -> Result<Arc<Channel>> {
            Err(Error::CallerSide("not connected".into()))
        }

        async fn reconnect(&self) -> Result<Arc<Channel>> {
            self.channel().await
        }

        fn current(&self) -> Option<Arc<Channel>> {
            None
        }
    }

    fn stub() -> ServiceStub {
        ServiceStub::new(
            "IEcho",
            "tests",
            Arc::new(Disconnected),
            Arc::new(InvocationManager::new(SerializationFormat::Json)),
            Duration::from_secs(3),
        )
    }

    const ECHO: MethodDescriptor = MethodDescriptor::unary("IEcho", "echo");
    const LOG: MethodDescriptor = MethodDescriptor::oneway("IEcho", "log");

    #[test]
    fn test_local_settings() {
        let stub = stub();
        assert_eq!(stub.timeout(), Duration::from_secs(3));
        stub.set_timeout(Duration::from_millis(200));
        assert_eq!(stub.timeout(), Duration::from_millis(200));
        stub.reset_timeout();
        assert_eq!(stub.timeout(), Duration::from_secs(3));

        assert!(!stub.is_debug());
        stub.set_debug(true);
        assert!(stub.is_debug());
        assert!(stub.peer_addr().is_none());
        assert!(stub.channel().is_none());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_rejected_locally() {
        let stub = stub();
        let err = stub.call::<_, ()>(&LOG, &("line",)).await.unwrap_err();
        assert!(matches!(err, Error::CallerSide(msg) if msg.contains("Oneway")));
    }

    #[tokio::test]
    async fn test_other_interface_is_rejected_locally() {
        const GET: MethodDescriptor = MethodDescriptor::unary("IStore", "get");
        let stub = stub();
        let err = stub.call::<_, String>(&GET, &("k",)).await.unwrap_err();
        assert!(matches!(err, Error::CallerSide(ref msg) if msg.contains("does not belong to IEcho")), "{}", err);
    }

    #[tokio::test]
    async fn test_provider_error_is_returned() {
        let stub = stub();
        let err = stub.call::<_, String>(&ECHO, &("hi",)).await.unwrap_err();
        assert!(err.is_caller_side());
    }
}
