//! Network handling functionality
pub mod interface;
pub mod registry;
pub mod relay;
pub mod session;
pub mod settings;
pub mod tunnel;

pub use interface::{AddressFamily, ChannelInterface, Packet, PacketInterface, TunInterface};
pub use registry::ConnectionRegistry;
pub use relay::RelayServer;
pub use session::{
    ConnectionSession, Frame, SessionEvent, SessionId, SessionObserver, SessionReceiver,
};
pub use settings::{
    HostConfigurator, LinuxHost, NetworkSettingsConfigurator, TunnelNetworkSettings,
};
pub use tunnel::{TunnelEndpoint, TunnelState};
