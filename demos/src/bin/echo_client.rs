//! Echo client for brpc
//!
//! Calls every `IEcho` method once and serves `IGreeter` so the server can
//! call back while the client is connected.

use brpc_config::{init_logging, ConfigLoader};
use brpc_core::Result;
use brpc_rpc::prelude::*;
use brpc_rpc::RpcClientConfig;
use brpc_rpc::ServiceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ECHO: MethodDescriptor = MethodDescriptor::unary("IEcho", "echo");
const SHOUT: MethodDescriptor = MethodDescriptor::oneway("IEcho", "shout");
const COUNTDOWN: MethodDescriptor = MethodDescriptor::streaming("IEcho", "countdown");

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = ConfigLoader::new().add_search_path("demos/config").load_with_env()?;
    config.app.name = "echo-client".to_string();
    init_logging(&config.logging)?;

    let registry = Arc::new(ServiceRegistry::new());
    registry.add_service(ServiceDefinition::new("IGreeter").method(MethodDefinition::unary(
        "greet",
        |(from,): (String,)| Ok(format!("hello {}, this is echo-client", from)),
    )))?;
    let client = RpcClient::with_registry(RpcClientConfig::from_config(&config)?, registry)?;
    let echo = client.stub("IEcho");

    let reply: String = echo.call(&ECHO, &("hello brpc",)).await?;
    info!("echo -> {}", reply);

    echo.call_oneway(&SHOUT, &("hello brpc",)).await?;

    let mut countdown = echo.call_streaming::<_, u32>(&COUNTDOWN, &(5u32,)).await?;
    while let Some(value) = countdown.next().await {
        info!("countdown -> {}", value?);
    }

    info!("Waiting for server callbacks, press Ctrl-C to exit");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
    }

    client.disconnect().await
}
