mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wsvpn::config::{ClientConfig, RelayConfig};
use wsvpn::network::{
    LinuxHost, NetworkSettingsConfigurator, RelayServer, TunInterface, TunnelEndpoint,
};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize the logger
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting wsvpn");
    let config = cli.load_config().context("failed to load configuration")?;

    match cli.command {
        Commands::Server { .. } => {
            info!("Starting in server mode");
            run_server(config.relay).await?;
        }
        Commands::Client { .. } => {
            info!("Starting in client mode");
            run_client(config.client).await?;
        }
    }

    info!("VPN service stopped");
    Ok(())
}

async fn run_server(config: RelayConfig) -> anyhow::Result<()> {
    let interface = TunInterface::open(&config.interface_name, config.mtu)?;
    interface
        .configure_address(&config.interface_address)
        .context("failed to configure relay interface")?;

    let listener = RelayServer::<TunInterface>::bind(config.listen_addr())?;
    let relay = RelayServer::new(Arc::new(interface));

    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(relay.run(listener, stop_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relay");
    let _ = stop_tx.send(true);
    running.await?;
    Ok(())
}

async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    info!("Tunnel configuration: {:?}", config);
    let interface = TunInterface::open(&config.interface_name, config.network.mtu)?;
    let host = LinuxHost::new(interface.name());
    let mut endpoint =
        TunnelEndpoint::new(Arc::new(interface), NetworkSettingsConfigurator::new(host));

    endpoint
        .start(&config.network)
        .await
        .context("failed to start tunnel")?;

    let mut state = endpoint.subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = state.wait_for(|s| *s != wsvpn::network::TunnelState::Active) => {
            error!("Tunnel went down; not reconnecting");
        }
    }

    endpoint.stop().await;
    if let Some(alert) = endpoint.last_alert() {
        info!("{}", alert);
    }
    info!("Tunnel stats: {}", endpoint.stats().format());
    Ok(())
}
