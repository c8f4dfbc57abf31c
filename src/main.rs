//! sandgate: host agent brokering ephemeral task containers and proxying
//! interactive terminal sessions to them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sandgate_agent::{subscribe_control, Advertiser, Agent, Registry};
use sandgate_backend::{DockerBackend, DockerBackendConfig};
use sandgate_bus::RedisMessageBus;
use sandgate_core::config::AgentConfig;
use sandgate_core::traits::{ContainerBackend, MessageBus};
use sandgate_gateway::ProxyServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    configure_tracing();

    let config_path = std::env::args().nth(1);
    let config = AgentConfig::load(config_path.as_deref()).context("loading configuration")?;

    let backend_config = DockerBackendConfig {
        image: config.backend.image.clone(),
        workdir: config.backend.workdir.clone(),
        shell: config.backend.shell.clone(),
        ..Default::default()
    };
    let backend: Arc<dyn ContainerBackend> = match &config.backend.socket {
        Some(socket) => Arc::new(DockerBackend::with_socket(backend_config, socket)?),
        None => Arc::new(DockerBackend::new(backend_config)?),
    };
    let bus: Arc<dyn MessageBus> = Arc::new(RedisMessageBus::new(&config.message_bus.url)?);
    let registry = Arc::new(Registry::new());

    let (agent, handle) = Agent::new(
        backend.clone(),
        registry.clone(),
        config.gateway.port,
        config.state_file.clone(),
    );
    tokio::spawn(agent.run());

    subscribe_control(handle.clone(), bus.clone())
        .await
        .context("subscribing to control subjects")?;

    let advertiser = Advertiser::new(
        handle.agent_id(),
        backend,
        bus,
        config.capacity.memory_bytes(),
        config.capacity.disk_bytes(),
        Duration::from_secs(config.advertise_interval_secs),
    );
    tokio::spawn(advertiser.run());

    let server = Arc::new(ProxyServer::new(registry));
    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    tokio::spawn(async move {
        if let Err(e) = server.run(host, port).await {
            tracing::error!(error = %e, "gateway terminated");
        }
    });

    tracing::info!(agent_id = %handle.agent_id(), port, "sandgate agent running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    Ok(())
}

fn configure_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sandgate=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
