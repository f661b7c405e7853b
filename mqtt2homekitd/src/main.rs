mod accessory;
mod api;
mod bridge_manager;
mod catalog;
mod codec;
mod config;
mod error;
mod hap;
mod mqtt;
mod registry;
mod router;
mod store;

use std::path::PathBuf;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::accessory::Information;
use crate::bridge_manager::BridgeHandle;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::hap::advertise::MdnsAccessoryServer;
use crate::registry::{Bridge, LivenessPolicy};
use crate::router::TopicRouter;
use crate::store::file::StateFile;

/// Bridge MQTT topics to HomeKit accessories
#[derive(Parser, Debug)]
#[command(name = "mqtt2homekitd", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(default_value = "/etc/mqtt2homekit/bridge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mqtt2homekitd=info"))
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting mqtt2homekitd {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    tracing::info!("Loaded config from {}", args.config.display());

    let catalog = Catalog::load(&config.bridge.catalog_extensions)?;
    let router = TopicRouter::new(config.mqtt.topic_prefix.clone());

    // Connect to the broker; an unreachable broker at startup is fatal
    let (mqtt_client, mut eventloop) = mqtt::client(&config.mqtt);
    mqtt::connect(&mqtt_client, &mut eventloop, &router.subscription())
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.mqtt.host, config.mqtt.port))?;

    // mDNS daemon, optionally restricted to one interface
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.bridge.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }
    let server = MdnsAccessoryServer::new(mdns_daemon, config.bridge.clone());

    let info = Information {
        manufacturer: config.bridge.manufacturer.clone(),
        ..Information::default()
    };
    let mut bridge = Bridge::new(router.clone(), catalog, Box::new(server), Box::new(mqtt_client.clone()))
        .with_information(info)
        .with_liveness(LivenessPolicy::from_config(&config.liveness))
        .with_store(StateFile::new(&config.bridge.state_path));

    bridge
        .load()
        .with_context(|| format!("Failed to load state from {}", config.bridge.state_path.display()))?;
    bridge.start();

    // Pin a freshly generated identity to disk straight away
    if let Err(e) = bridge.persist() {
        tracing::error!(code = e.error_code(), "Failed to save bridge state: {}", e);
    }

    let bridge_handle = BridgeHandle::spawn(bridge);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Bus subscriber task
    let (bus_tx, bus_rx) = mpsc::channel(256);
    let sub_cancel = cancel.clone();
    let sub_client = mqtt_client.clone();
    let subscription = router.subscription();
    let sub_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_subscriber(sub_client, eventloop, subscription, bus_tx, sub_cancel).await {
            tracing::error!("MQTT subscriber error: {}", e);
        }
    });

    // Bridge manager task
    let mgr_cancel = cancel.clone();
    let mgr_config = config.liveness.clone();
    let mgr_bridge = bridge_handle.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = bridge_manager::run(mgr_bridge, bus_rx, mgr_config, mgr_cancel).await {
            tracing::error!("Bridge manager error: {}", e);
        }
    });

    // Local control API
    let app = api::routes::router(api::routes::AppState {
        bridge: bridge_handle.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(sub_handle, mgr_handle, server_handle);

    // Final snapshot and mDNS withdrawal happen on the bridge thread
    if let Err(e) = bridge_handle.shutdown().await {
        tracing::error!("Failed to shutdown bridge: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
