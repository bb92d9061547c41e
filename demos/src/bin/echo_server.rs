//! Echo server for brpc
//!
//! Serves `IEcho` (echo, shout, countdown) and greets every client that
//! announces itself as `echo-client` by calling back into its `IGreeter`.

use brpc_config::{init_logging, ConfigLoader};
use brpc_core::Result;
use brpc_rpc::prelude::*;
use brpc_rpc::{RpcServerConfig, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const GREET: MethodDescriptor = MethodDescriptor::unary("IGreeter", "greet");

fn echo_service() -> ServiceDefinition {
    ServiceDefinition::new("IEcho")
        .with_description("echoes text back to the caller")
        .method(MethodDefinition::unary("echo", |(text,): (String,)| Ok(text)))
        .method(MethodDefinition::oneway("shout", |(text,): (String,)| {
            info!("{}!", text.to_uppercase());
            Ok(())
        }))
        .method(MethodDefinition::streaming("countdown", |(from,): (u32,), sink: StreamSink<u32>| {
            for i in (0..=from).rev() {
                if !sink.on_next(&i) {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            sink.on_complete();
            Ok(())
        }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::new().add_search_path("demos/config").load_with_env()?;
    init_logging(&config.logging)?;

    let registry = Arc::new(ServiceRegistry::new());
    registry.add_service(echo_service())?;
    let server = RpcServer::start(RpcServerConfig::from_config(&config)?, registry).await?;
    info!("Echo server ready on {}", server.local_addr());

    let mut greet = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = greet.tick() => {
                for stub in server.get_remote_services("echo-client", "IGreeter") {
                    match stub.call::<_, String>(&GREET, &("echo-server",)).await {
                        Ok(reply) => info!("{:?} replied: {}", stub.peer_addr(), reply),
                        Err(e) => warn!("Greeting {:?} failed: {}", stub.peer_addr(), e),
                    }
                }
            }
        }
    }

    server.shutdown().await;
    Ok(())
}
