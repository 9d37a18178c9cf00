//! Command-line interface for the VPN application

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use wsvpn::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (JSON, TOML or YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay
    Server {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// TUN device to create
        #[arg(short, long)]
        interface: Option<String>,

        /// Relay address on the tunnel subnet, CIDR notation
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Run the tunnel client
    Client {
        /// Relay address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Relay port to connect to
        #[arg(short, long)]
        port: Option<u16>,

        /// TUN device to create
        #[arg(short, long)]
        interface: Option<String>,

        /// Route traffic to the relay itself through the tunnel as well
        #[arg(long)]
        no_exclude_route: bool,
    },
}

impl Cli {
    /// Load the configuration and apply command line overrides
    pub fn load_config(&self) -> Result<Config, config::ConfigError> {
        let mut config = Config::load(self.config.as_deref())?;

        match &self.command {
            Commands::Server {
                listen,
                port,
                interface,
                address,
            } => {
                if let Some(listen) = listen {
                    config.relay.listen_address = *listen;
                }
                if let Some(port) = port {
                    config.relay.listen_port = *port;
                }
                if let Some(interface) = interface {
                    config.relay.interface_name = interface.clone();
                }
                if let Some(address) = address {
                    config.relay.interface_address = address.clone();
                }
            }
            Commands::Client {
                server,
                port,
                interface,
                no_exclude_route,
            } => {
                if let Some(server) = server {
                    config.client.network.remote_address = Some(server.clone());
                }
                if let Some(port) = port {
                    config.client.network.remote_port = *port;
                }
                if let Some(interface) = interface {
                    config.client.interface_name = interface.clone();
                }
                if *no_exclude_route {
                    config.client.network.exclude_remote_route = false;
                }
            }
        }

        Ok(config)
    }
}
