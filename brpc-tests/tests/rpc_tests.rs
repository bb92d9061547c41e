//! End-to-end unary and oneway calls between a real client and server

use brpc_core::Error;
use brpc_rpc::prelude::*;
use brpc_rpc::{MethodDefinition, ServiceDefinition};
use brpc_tests::*;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Test 1: Round trip of primitive, string and structured values
#[tokio::test]
async fn test_round_trip_values() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "round-trip").build().unwrap();
    let stub = client.stub("ITest");

    let sum: i64 = stub.call(&ADD, &(40i64, 2i64)).await.unwrap();
    assert_eq!(sum, 42);

    let echoed: String = stub.call(&ECHO, &("héllo wörld",)).await.unwrap();
    assert_eq!(echoed, "héllo wörld");

    let profile = Profile {
        id: 7,
        name: "agent".to_string(),
        tags: vec!["a".to_string()],
        score: Some(0.5),
    };
    let returned: Profile = stub.call(&PROFILE, &(profile.clone(),)).await.unwrap();
    assert_eq!(returned.id, profile.id);
    assert_eq!(returned.tags, vec!["a".to_string(), "seen".to_string()]);
    assert_eq!(client.pending_request_count(), 0);
}

/// Test 2: Every serializer reaches the same handler
#[tokio::test]
async fn test_serializers_interoperate() {
    let server = start_server(Arc::new(CallCounter::default())).await;

    for format in [
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
        SerializationFormat::Bincode,
    ] {
        let client = client_builder(&server, "formats").serializer(format).build().unwrap();
        let stub = client.stub("ITest");
        let profile = Profile {
            id: 1,
            name: format.to_string(),
            tags: Vec::new(),
            score: None,
        };
        let returned: Profile = stub.call(&PROFILE, &(profile,)).await.unwrap();
        assert_eq!(returned.name, format.name());
    }

    // Per-method override on top of the client default
    const ADD_BINCODE: MethodDescriptor = ADD.with_serializer(SerializationFormat::Bincode);
    let client = client_builder(&server, "formats").build().unwrap();
    let sum: i64 = client.stub("ITest").call(&ADD_BINCODE, &(1i64, 2i64)).await.unwrap();
    assert_eq!(sum, 3);
}

/// Test 3: Oneway returns without waiting for a sleeping handler
#[tokio::test]
async fn test_oneway_does_not_wait() {
    let counter = Arc::new(CallCounter::default());
    let server = start_server(counter.clone()).await;
    let client = client_builder(&server, "oneway").build().unwrap();
    client.connect().await.unwrap();
    let stub = client.stub("ITest");

    let started = Instant::now();
    stub.call_oneway(&RECORD, &(500u64,)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
    assert_eq!(counter.recorded(), 0);
    assert_eq!(client.pending_request_count(), 0);

    assert!(eventually(Duration::from_secs(3), || counter.recorded() == 1).await);
}

/// Test 4: A 200ms timeout fires on time and the late response is dropped
#[tokio::test]
async fn test_timeout_and_late_response() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "timeouts").build().unwrap();
    client.connect().await.unwrap();
    let stub = client.stub("ITest");
    stub.set_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let err = stub.call::<_, u64>(&SLOW, &(600u64, 1u64)).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, Error::Timeout { timeout_ms: 200, .. }), "{}", err);
    assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "{:?}", elapsed);
    assert_eq!(client.pending_request_count(), 0);

    // The handler answers at ~600ms; nobody is waiting for it any more
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.pending_request_count(), 0);

    stub.reset_timeout();
    let id: u64 = stub.call(&SLOW, &(0u64, 2u64)).await.unwrap();
    assert_eq!(id, 2);
}

/// Test 5: Concurrent calls with random server delays get their own answers
#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "concurrency").build().unwrap();
    client.connect().await.unwrap();

    let mut handles = Vec::new();
    for id in 0..24u64 {
        let stub = client.stub("ITest");
        let delay = rand::thread_rng().gen_range(0..100u64);
        handles.push(tokio::spawn(async move {
            let answer: u64 = stub.call(&SLOW, &(delay, id)).await.unwrap();
            (id, answer)
        }));
    }

    for handle in handles {
        let (id, answer) = handle.await.unwrap();
        assert_eq!(id, answer);
    }
    assert_eq!(client.pending_request_count(), 0);
}

/// Test 6: Callee errors and unknown methods surface as callee-side errors
#[tokio::test]
async fn test_remote_errors() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "errors").build().unwrap();
    let stub = client.stub("ITest");

    let err = stub.call::<_, ()>(&FAIL, &("disk full",)).await.unwrap_err();
    assert!(err.is_callee_side());
    assert!(err.to_string().contains("disk full"), "{}", err);

    const MISSING: MethodDescriptor = MethodDescriptor::unary("ITest", "missing");
    let err = stub.call::<_, ()>(&MISSING, &()).await.unwrap_err();
    assert!(matches!(err, Error::CalleeSide(ref msg) if msg.contains("ITest#missing")), "{}", err);

    // Wrong argument shape
    let err = stub.call::<_, i64>(&ADD, &("one", "two")).await.unwrap_err();
    assert!(err.to_string().contains("cannot decode arguments"), "{}", err);

    // The connection survives all of the above
    let sum: i64 = stub.call(&ADD, &(1i64, 1i64)).await.unwrap();
    assert_eq!(sum, 2);
}

/// Test 7: The client reconnects after the server drops the connection
#[tokio::test]
async fn test_reconnect_after_server_drop() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "reconnect").build().unwrap();
    let stub = client.stub("ITest");

    let first: String = stub.call(&ECHO, &("before",)).await.unwrap();
    assert_eq!(first, "before");
    let first_channel = client.channel().unwrap().id();

    assert!(eventually(Duration::from_secs(2), || server.sessions().len() == 1).await);
    for session in server.sessions() {
        session.channel().close();
    }
    assert!(eventually(Duration::from_secs(2), || !client.is_connected()).await);

    let second: String = stub.call(&ECHO, &("after",)).await.unwrap();
    assert_eq!(second, "after");
    assert_ne!(client.channel().unwrap().id(), first_channel);
    assert!(eventually(Duration::from_secs(1), || server.stats().total_connections == 2).await);
}

/// Test 8: In-flight calls fail when the connection is lost
#[tokio::test]
async fn test_inflight_calls_fail_on_disconnect() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "disconnect").build().unwrap();
    client.connect().await.unwrap();
    let stub = client.stub("ITest");

    let pending = tokio::spawn(async move { stub.call::<_, u64>(&SLOW, &(1_000u64, 1u64)).await });
    assert!(eventually(Duration::from_secs(2), || client.pending_request_count() == 1).await);

    client.disconnect().await.unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Channel(_)), "{}", err);
    assert_eq!(client.pending_request_count(), 0);
}

/// Test 9: Registering the same service twice still dispatches each call once
#[tokio::test]
async fn test_double_registration_dispatches_once() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let definition = |calls: Arc<AtomicUsize>| {
        ServiceDefinition::new("ICounter").method(MethodDefinition::unary("hit", move |(): ()| {
            Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
        }))
    };

    let registry = Arc::new(ServiceRegistry::new());
    registry.add_service(definition(calls.clone())).unwrap();
    registry.add_service(definition(calls.clone())).unwrap();

    let server = RpcServer::start(
        brpc_rpc::RpcServerConfig {
            bind_address: loopback(),
            ..Default::default()
        },
        registry,
    )
    .await
    .unwrap();
    let client = client_builder(&server, "counter").build().unwrap();

    const HIT: MethodDescriptor = MethodDescriptor::unary("ICounter", "hit");
    let count: usize = client.stub("ICounter").call(&HIT, &()).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test 10: Aliased methods are addressed by their exposed name
#[tokio::test]
async fn test_method_alias() {
    init_tracing();
    let server = RpcServer::builder()
        .bind(loopback())
        .service(
            ServiceDefinition::new("IMath")
                .method(MethodDefinition::unary("add_i64", |(a, b): (i64, i64)| Ok(a + b)).with_alias("add")),
        )
        .start()
        .await
        .unwrap();
    let client = client_builder(&server, "alias").build().unwrap();

    const ADD_ALIASED: MethodDescriptor = MethodDescriptor::unary("IMath", "add_i64").with_alias("add");
    let sum: i64 = client.stub("IMath").call(&ADD_ALIASED, &(2i64, 3i64)).await.unwrap();
    assert_eq!(sum, 5);
}

/// Test 11: Stub settings never reach the wire
#[tokio::test]
async fn test_local_stub_methods() {
    let counter = Arc::new(CallCounter::default());
    let server = start_server(counter.clone()).await;
    let client = client_builder(&server, "local").build().unwrap();
    let stub = client.stub("ITest");

    assert!(stub.peer_addr().is_none());
    stub.set_debug(true);
    stub.set_timeout(Duration::from_millis(250));
    assert_eq!(stub.timeout(), Duration::from_millis(250));
    stub.reset_timeout();
    assert_eq!(stub.timeout(), Duration::from_secs(5));

    let _: String = stub.call(&ECHO, &("x",)).await.unwrap();
    assert_eq!(stub.peer_addr(), Some(server.local_addr()));
    assert!(stub.channel().is_some());
    assert_eq!(counter.echoed(), 1);
}
