//! End-to-end server-push streaming

use brpc_core::{Error, ExecutorKind};
use brpc_rpc::prelude::*;
use brpc_tests::*;
use std::sync::Arc;
use std::time::Duration;

/// Test 1: A stream delivers its values in order and then completes
#[tokio::test]
async fn test_stream_values_then_completion() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();
    let stub = client.stub("ITest");

    let mut stream = stub.call_streaming::<_, u32>(&COUNT, &(3u32,)).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    assert_eq!(stream.next().await.unwrap().unwrap(), 2);
    assert_eq!(stream.next().await.unwrap().unwrap(), 3);
    assert!(stream.next().await.is_none());

    assert!(eventually(Duration::from_secs(1), || server.active_streams() == 0).await);
}

/// Test 2: An empty stream completes immediately
#[tokio::test]
async fn test_empty_stream() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();

    let values = client
        .stub("ITest")
        .call_streaming::<_, u32>(&COUNT, &(0u32,))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(values.is_empty());
}

/// Test 3: A handler error ends the stream after the values already sent
#[tokio::test]
async fn test_stream_error() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();

    let mut stream = client
        .stub("ITest")
        .call_streaming::<_, u32>(&BROKEN, &())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    match stream.next().await {
        Some(Err(Error::CalleeSide(msg))) => assert!(msg.contains("source went away"), "{}", msg),
        other => panic!("unexpected {:?}", other.map(|r| r.map(|_| ()))),
    }
    assert!(stream.next().await.is_none());
}

/// Test 4: Cancelling mid-stream stops emission and removes the server context
#[tokio::test]
async fn test_cancel_mid_stream() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();
    let stub = client.stub("ITest");

    let mut stream = stub.call_streaming::<_, u64>(&TICKS, &()).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), 0);
    assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    assert_eq!(server.active_streams(), 1);

    stub.cancel_streaming(stream.transaction_id()).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || server.active_streams() == 0).await);

    // Values already in flight drain out, then the local stream ends
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(value) = stream.next().await {
            value.unwrap();
        }
    })
    .await;
    assert!(drained.is_ok());
    assert!(client.channel().unwrap().is_active());
}

/// Test 5: Unknown streaming methods end the stream with the lookup error
#[tokio::test]
async fn test_unknown_streaming_method() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();

    const NOPE: MethodDescriptor = MethodDescriptor::streaming("ITest", "nope");
    let result = client
        .stub("ITest")
        .call_streaming::<_, u32>(&NOPE, &())
        .await
        .unwrap()
        .try_collect()
        .await;
    assert!(matches!(result, Err(Error::CalleeSide(ref msg)) if msg.contains("ITest#nope")));
}

/// Test 6: Losing the connection ends the caller's stream and cancels the server's
#[tokio::test]
async fn test_connection_loss_during_stream() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();

    let mut stream = client
        .stub("ITest")
        .call_streaming::<_, u64>(&TICKS, &())
        .await
        .unwrap();
    stream.next().await.unwrap().unwrap();

    client.channel().unwrap().close();

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.next().await {
                Some(Ok(_)) => continue,
                other => return other,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(ended, Some(Err(Error::Channel(_)))), "{:?}", ended.map(|r| r.map(|_| ())));
    assert!(eventually(Duration::from_secs(2), || server.active_streams() == 0).await);
}

/// Test 7: Cancelling reaches a handler that polls `is_cancelled` while it
/// holds the only worker
#[tokio::test]
async fn test_cancel_polling_handler_on_single_worker() {
    init_tracing();
    const POLL: MethodDescriptor = MethodDescriptor::streaming("IPoll", "poll");
    const PING: MethodDescriptor = MethodDescriptor::unary("IPoll", "ping");

    let server = RpcServer::builder()
        .bind(loopback())
        .executor(ExecutorKind::WorkerPool, 1)
        .service(
            ServiceDefinition::new("IPoll")
                .method(MethodDefinition::streaming("poll", |(): (), sink: StreamSink<u32>| {
                    let mut i = 0u32;
                    while !sink.is_cancelled() {
                        sink.on_next(&i);
                        i += 1;
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Ok(())
                }))
                .method(MethodDefinition::unary("ping", |(): ()| Ok("pong".to_string()))),
        )
        .start()
        .await
        .unwrap();
    let client = client_builder(&server, "poller").build().unwrap();
    let stub = client.stub("IPoll");

    let mut stream = stub.call_streaming::<_, u32>(&POLL, &()).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), 0);
    assert_eq!(server.active_streams(), 1);

    stub.cancel_streaming(stream.transaction_id()).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || server.active_streams() == 0).await);

    // The worker is free again once the handler saw the cancellation
    let pong: String = stub.call(&PING, &()).await.unwrap();
    assert_eq!(pong, "pong");
}

/// Test 8: Dropping an unfinished stream cancels it on the server
#[tokio::test]
async fn test_dropping_stream_cancels_remote() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "streams").build().unwrap();

    let mut stream = client
        .stub("ITest")
        .call_streaming::<_, u64>(&TICKS, &())
        .await
        .unwrap();
    stream.next().await.unwrap().unwrap();
    assert_eq!(server.active_streams(), 1);

    drop(stream);
    assert!(eventually(Duration::from_secs(2), || server.active_streams() == 0).await);
    assert!(client.channel().unwrap().is_active());
}
