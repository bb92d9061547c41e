//! Shared fixtures for the end-to-end tests: a test service, its stub
//! descriptors and helpers to start servers and clients on loopback.

use brpc_core::{Error, ExecutorKind, Result};
use brpc_rpc::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

pub const ECHO: MethodDescriptor = MethodDescriptor::unary("ITest", "echo");
pub const ADD: MethodDescriptor = MethodDescriptor::unary("ITest", "add");
pub const PROFILE: MethodDescriptor = MethodDescriptor::unary("ITest", "profile");
pub const SLOW: MethodDescriptor = MethodDescriptor::unary("ITest", "slow");
pub const FAIL: MethodDescriptor = MethodDescriptor::unary("ITest", "fail");
pub const RECORD: MethodDescriptor = MethodDescriptor::oneway("ITest", "record");
pub const COUNT: MethodDescriptor = MethodDescriptor::streaming("ITest", "count");
pub const TICKS: MethodDescriptor = MethodDescriptor::streaming("ITest", "ticks");
pub const BROKEN: MethodDescriptor = MethodDescriptor::streaming("ITest", "broken");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: u64,
    pub name: String,
    pub tags: Vec<String>,
    pub score: Option<f64>,
}

/// Observable side effects of the test service
#[derive(Default)]
pub struct CallCounter {
    pub recorded: AtomicUsize,
    pub echoed: AtomicUsize,
}

impl CallCounter {
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::SeqCst)
    }

    pub fn echoed(&self) -> usize {
        self.echoed.load(Ordering::SeqCst)
    }
}

/// `ITest`: every call shape the runtime supports
pub fn test_service(counter: Arc<CallCounter>) -> ServiceDefinition {
    let echo_counter = counter.clone();
    ServiceDefinition::new("ITest")
        .with_description("end-to-end test service")
        .method(MethodDefinition::unary("echo", move |(s,): (String,)| {
            echo_counter.echoed.fetch_add(1, Ordering::SeqCst);
            Ok(s)
        }))
        .method(MethodDefinition::unary("add", |(a, b): (i64, i64)| Ok(a + b)))
        .method(MethodDefinition::unary("profile", |(mut p,): (Profile,)| {
            p.tags.push("seen".to_string());
            Ok(p)
        }))
        .method(MethodDefinition::unary("slow", |(delay_ms, id): (u64, u64)| {
            std::thread::sleep(Duration::from_millis(delay_ms));
            Ok(id)
        }))
        .method(MethodDefinition::unary("fail", |(msg,): (String,)| -> Result<()> {
            Err(Error::ServiceInvocation(msg))
        }))
        .method(MethodDefinition::oneway("record", move |(delay_ms,): (u64,)| {
            std::thread::sleep(Duration::from_millis(delay_ms));
            counter.recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .method(MethodDefinition::streaming("count", |(n,): (u32,), sink: StreamSink<u32>| {
            for i in 1..=n {
                if !sink.on_next(&i) {
                    return Ok(());
                }
            }
            sink.on_complete();
            Ok(())
        }))
        .method(MethodDefinition::streaming("ticks", |(): (), sink: StreamSink<u64>| {
            std::thread::spawn(move || {
                let mut tick = 0u64;
                while sink.on_next(&tick) {
                    tick += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
            Ok(())
        }))
        .method(MethodDefinition::streaming("broken", |(): (), sink: StreamSink<u32>| {
            sink.on_next(&1);
            sink.on_error("source went away");
            Ok(())
        }))
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Server on an ephemeral port serving [`test_service`]
pub async fn start_server(counter: Arc<CallCounter>) -> RpcServer {
    init_tracing();
    RpcServer::builder()
        .bind(loopback())
        .app_name("test-server")
        .executor(ExecutorKind::WorkerPool, 32)
        .service(test_service(counter))
        .start()
        .await
        .expect("server starts")
}

pub fn client_builder(server: &RpcServer, app_name: &str) -> RpcClientBuilder {
    RpcClient::builder()
        .endpoint(server.local_addr())
        .app_name(app_name)
        .retry_interval(Duration::from_millis(50))
        .request_timeout(Duration::from_secs(5))
}

/// Poll `condition` every 10ms for up to `within`
pub async fn eventually<F: Fn() -> bool>(within: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
