//! Configuration management for the VPN application
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Port the relay listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 54345;

/// Prefix of the environment variables read by [`Config::load`]
pub const ENV_PREFIX: &str = "WSVPN";

/// Addressing, routing and DNS parameters applied to the client tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Relay host name or address
    pub remote_address: Option<String>,

    /// Relay port
    pub remote_port: u16,

    /// Address assigned to the client side of the tunnel
    pub client_ip: Ipv4Addr,

    /// Subnet mask for `client_ip`
    pub subnet_mask: Ipv4Addr,

    /// DNS servers, in order of preference
    pub dns_servers: Vec<IpAddr>,

    /// MTU size
    pub mtu: u16,

    /// Keep traffic to the relay itself off the tunnel
    pub exclude_remote_route: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            remote_address: None,
            remote_port: DEFAULT_PORT,
            client_ip: Ipv4Addr::new(10, 8, 0, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 4, 4, 4)),
            ],
            mtu: 1400,
            exclude_remote_route: true,
        }
    }
}

impl NetworkConfig {
    /// Config pointing at `remote_address` with every other field defaulted
    pub fn with_remote(remote_address: impl Into<String>, remote_port: u16) -> Self {
        NetworkConfig {
            remote_address: Some(remote_address.into()),
            remote_port,
            ..Default::default()
        }
    }

    /// The relay address, rejecting a missing or blank value
    pub fn remote_address(&self) -> Result<&str, ConfigurationError> {
        self.remote_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .ok_or(ConfigurationError::MissingField("remote_address"))
    }

    /// WebSocket URL of the relay: path-less, no sub-protocol
    pub fn relay_url(&self) -> Result<String, ConfigurationError> {
        let host = self.remote_address()?;
        let url = match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("ws://[{}]:{}", v6, self.remote_port),
            _ => format!("ws://{}:{}", host, self.remote_port),
        };
        Ok(url)
    }
}

/// Client process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name of the TUN device to create
    pub interface_name: String,

    #[serde(flatten)]
    pub network: NetworkConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            interface_name: "wsvpn0".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

/// Relay process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to listen on
    pub listen_address: IpAddr,

    /// Port to listen on
    pub listen_port: u16,

    /// Name of the TUN device to create
    pub interface_name: String,

    /// Relay side address of the tunnel subnet (CIDR notation)
    pub interface_address: String,

    /// MTU size
    pub mtu: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            interface_name: "tun0".to_string(),
            interface_address: "10.8.0.1/24".to_string(),
            mtu: 1400,
        }
    }
}

impl RelayConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }
}

/// VPN configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Layer an optional file and `WSVPN_*` environment variables over the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_layers(path, None)
    }

    /// `env` replaces the process environment when given
    fn load_layers(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("client.dns_servers")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}
