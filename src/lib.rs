//! Minimal userspace VPN relaying raw IP packets over WebSockets.
//!
//! A client ([`network::TunnelEndpoint`]) reads packets from its TUN device and
//! sends each one as a binary WebSocket message to a relay
//! ([`network::RelayServer`]), which writes them to its own TUN device and
//! broadcasts return traffic to every connected client.
//!
//! Traffic is neither encrypted nor authenticated.

pub mod config;
pub mod error;
pub mod network;

pub use config::{Config, NetworkConfig, RelayConfig};
pub use error::{ConfigurationError, InterfaceError, ProtocolError, TransportError, TunnelError};
