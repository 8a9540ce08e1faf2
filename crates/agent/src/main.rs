//! OVS Agent - per-node virtual switch state publisher
//!
//! This binary runs as a DaemonSet on each Kubernetes node, mirroring the
//! local switch database and keeping the node's AgentInfo object current.

use anyhow::{Context, Result};
use ovs_agent_lib::{
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    ovsdb::{EndpointEvent, OvsdbMonitor},
    sync::{
        AgentInfoIndex, AgentInfoStore, AgentMonitorBuilder, KubeAgentInfoIndex,
        KubeAgentInfoStore, MemoryAgentInfoStore,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for loops to drain after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting ovs-agent");

    let config = config::AgentConfig::load()?;
    let agent_name = config.agent_name().to_string();
    info!(
        node_name = %config.node_name,
        agent = %agent_name,
        use_kube = config.use_kube,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::OVSDB_MONITOR).await;

    let metrics = AgentMetrics::new();

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, &agent_name);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Switch database cache mirror, logging every endpoint change
    let ovsdb = Arc::new(OvsdbMonitor::new());
    ovsdb.set_health(health_registry.clone());
    let endpoint_logger = logger.clone();
    ovsdb.register_event_handler(Arc::new(move |event: &EndpointEvent| {
        let endpoint = match event {
            EndpointEvent::Added(ep) | EndpointEvent::Deleted(ep) => ep,
            EndpointEvent::Updated { new, .. } => new,
        };
        endpoint_logger.log_endpoint_event(
            event.kind(),
            &endpoint.interface_name,
            &endpoint.bridge_name,
            &endpoint.mac,
        );
    }));

    let (store, index): (Arc<dyn AgentInfoStore>, Arc<dyn AgentInfoIndex>) = if config.use_kube {
        let client = kube::Client::try_default()
            .await
            .context("failed to create Kubernetes client")?;
        let index: Arc<dyn AgentInfoIndex> =
            Arc::new(KubeAgentInfoIndex::spawn(client.clone(), shutdown_tx.subscribe()));
        let store: Arc<dyn AgentInfoStore> = Arc::new(KubeAgentInfoStore::new(client));
        (store, index)
    } else {
        warn!("Kubernetes disabled, AgentInfo is kept in memory only");
        let memory = Arc::new(MemoryAgentInfoStore::new());
        memory.set_synced(true);
        let store: Arc<dyn AgentInfoStore> = memory.clone();
        let index: Arc<dyn AgentInfoIndex> = memory;
        (store, index)
    };

    let monitor = Arc::new(
        AgentMonitorBuilder::new()
            .name(agent_name.clone())
            .store(store)
            .index(index)
            .ovsdb(Arc::clone(&ovsdb))
            .health(health_registry.clone())
            .sync_interval(config.sync_interval())
            .retry_delay(config.retry_delay())
            .build()?,
    );

    let (learned_tx, learned_rx) = mpsc::channel(config.learning_channel_capacity);
    let (table_updates_tx, table_updates_rx) = mpsc::channel(config.table_update_channel_capacity);

    let ovsdb_handle = tokio::spawn(Arc::clone(&ovsdb).run(table_updates_rx, shutdown_tx.subscribe()));
    let monitor_handle =
        tokio::spawn(Arc::clone(&monitor).run(learned_rx, shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        learned_tx,
        table_updates_tx,
        Arc::clone(&monitor),
    ));

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = ovsdb_handle.await;
        let _ = monitor_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for loops to stop");
    }
    api_handle.abort();

    info!("Shutting down");
    Ok(())
}
