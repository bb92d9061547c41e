//! Server-side sessions and calls from the server back to its clients

use brpc_rpc::prelude::*;
use brpc_tests::*;
use std::sync::Arc;
use std::time::Duration;

const PING: MethodDescriptor = MethodDescriptor::unary("IAgent", "ping");

fn agent_service(name: &'static str) -> ServiceDefinition {
    ServiceDefinition::new("IAgent").method(MethodDefinition::unary("ping", move |(n,): (u32,)| {
        Ok(format!("{}:{}", name, n + 1))
    }))
}

#[tokio::test]
async fn test_session_registered_by_application_name() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "collector").build().unwrap();

    let _: String = client.stub("ITest").call(&ECHO, &("hi",)).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || server.sessions().len() == 1).await);

    let session = server.sessions().pop().unwrap();
    assert_eq!(session.remote_application_name(), "collector");
    assert_eq!(session.local_endpoint(), server.local_addr());
    assert_eq!(Some(session.remote_endpoint()), client.channel().map(|c| c.local_addr()));
    assert_eq!(server.session_manager().sessions_for("collector").len(), 1);
    assert!(server.session_manager().sessions_for("someone-else").is_empty());
}

#[tokio::test]
async fn test_session_removed_on_disconnect() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "collector").build().unwrap();

    let _: String = client.stub("ITest").call(&ECHO, &("hi",)).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || server.sessions().len() == 1).await);

    client.disconnect().await.unwrap();
    assert!(eventually(Duration::from_secs(2), || server.sessions().is_empty()).await);
    assert!(server.get_remote_services("collector", "IAgent").is_empty());
}

#[tokio::test]
async fn test_server_calls_back_into_clients() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let first = client_builder(&server, "agents")
        .service(agent_service("first"))
        .build()
        .unwrap();
    let second = client_builder(&server, "agents")
        .service(agent_service("second"))
        .build()
        .unwrap();

    // A session exists once the client has identified itself with a call
    let _: String = first.stub("ITest").call(&ECHO, &("a",)).await.unwrap();
    let _: String = second.stub("ITest").call(&ECHO, &("b",)).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || server.sessions().len() == 2).await);

    let stubs = server.get_remote_services("agents", "IAgent");
    assert_eq!(stubs.len(), 2);

    let mut answers = Vec::new();
    for stub in &stubs {
        assert_eq!(stub.interface(), "IAgent");
        answers.push(stub.call::<_, String>(&PING, &(41u32,)).await.unwrap());
    }
    answers.sort();
    assert_eq!(answers, vec!["first:42".to_string(), "second:42".to_string()]);
    assert_eq!(server.pending_request_count(), 0);
}

#[tokio::test]
async fn test_callback_to_client_without_the_service() {
    let server = start_server(Arc::new(CallCounter::default())).await;
    let client = client_builder(&server, "plain").build().unwrap();

    let _: String = client.stub("ITest").call(&ECHO, &("a",)).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || server.sessions().len() == 1).await);

    let stub = server.get_remote_services("plain", "IAgent").pop().unwrap();
    let err = stub.call::<_, String>(&PING, &(1u32,)).await.unwrap_err();
    assert!(err.is_callee_side(), "{}", err);
    assert!(err.to_string().contains("IAgent#ping"), "{}", err);
}
