//! Virtual network interface implementation
use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace};
use tun_tap::{Iface, Mode};

use crate::error::InterfaceError;

/// One raw IP datagram
pub type Packet = Vec<u8>;

/// Upper bound on packets handed out by a single `read_packets` call
pub const MAX_BATCH: usize = 64;

/// Size of the packet-information header the kernel prepends on TUN devices
const PI_HEADER_LEN: usize = 4;

/// Packets buffered between the device reader thread and the pumps
const READ_QUEUE_DEPTH: usize = 1024;

/// Address family a packet is tagged with when written to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// EtherType used in the TUN packet-information header
    pub fn ether_type(self) -> u16 {
        match self {
            AddressFamily::Inet => 0x0800,
            AddressFamily::Inet6 => 0x86DD,
        }
    }
}

/// A device packets can be read from and injected into
#[async_trait]
pub trait PacketInterface: Send + Sync + 'static {
    /// Wait for the next batch of packets. `None` once the read side has ended.
    async fn read_packets(&self) -> Option<Vec<Packet>>;

    /// Inject packets, tagged with `family`
    fn write_packets(&self, packets: &[Packet], family: AddressFamily)
        -> Result<(), InterfaceError>;
}

/// Wait for one packet, then take whatever else is already queued
async fn recv_batch(rx: &mut mpsc::Receiver<Packet>) -> Option<Vec<Packet>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while batch.len() < MAX_BATCH {
        match rx.try_recv() {
            Ok(packet) => batch.push(packet),
            Err(_) => break,
        }
    }
    Some(batch)
}

/// Prefix `packet` with the packet-information header for `family`
fn frame_for_device(packet: &[u8], family: AddressFamily) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PI_HEADER_LEN + packet.len());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&family.ether_type().to_be_bytes());
    frame.extend_from_slice(packet);
    frame
}

/// Strip the packet-information header from a frame read off the device
fn packet_from_device(frame: &[u8]) -> Option<&[u8]> {
    match frame.get(PI_HEADER_LEN..) {
        Some(packet) if !packet.is_empty() => Some(packet),
        _ => None,
    }
}

/// TUN device backed by `tun-tap`
///
/// The device is read on a dedicated thread feeding a bounded channel, so the
/// async side never blocks on the file descriptor.
pub struct TunInterface {
    iface: Arc<Iface>,
    name: String,
    mtu: u16,
    inbound: Mutex<mpsc::Receiver<Packet>>,
}

impl TunInterface {
    /// Create a new TUN interface and start reading from it
    pub fn open(name_prefix: &str, mtu: u16) -> Result<Self, InterfaceError> {
        let iface =
            Arc::new(Iface::new(name_prefix, Mode::Tun).map_err(InterfaceError::CreationFailed)?);
        let name = iface.name().to_string();
        info!("Created TUN interface: {}", name);

        let (tx, rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let reader = Arc::clone(&iface);
        let buffer_len = mtu as usize + PI_HEADER_LEN;
        thread::Builder::new()
            .name(format!("{}-reader", name))
            .spawn(move || read_device(reader, buffer_len, tx))
            .map_err(InterfaceError::CreationFailed)?;

        Ok(TunInterface {
            iface,
            name,
            mtu,
            inbound: Mutex::new(rx),
        })
    }

    /// Assign an address in CIDR notation, set the MTU and bring the link up
    pub fn configure_address(&self, ip_cidr: &str) -> Result<(), InterfaceError> {
        let (ip_address, netmask) =
            parse_cidr(ip_cidr).map_err(|e| InterfaceError::ConfigurationFailed(e.to_string()))?;

        configure_interface(&self.name, &ip_address, &netmask, self.mtu)
            .map_err(|e| InterfaceError::ConfigurationFailed(e.to_string()))?;

        info!(
            "Configured interface {} with IP {}/{} and MTU {}",
            self.name, ip_address, netmask, self.mtu
        );
        Ok(())
    }

    /// Get the interface name
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn read_device(iface: Arc<Iface>, buffer_len: usize, tx: mpsc::Sender<Packet>) {
    let mut buffer = vec![0u8; buffer_len];
    loop {
        let size = match iface.recv(&mut buffer) {
            Ok(size) => size,
            Err(e) => {
                error!("{}", InterfaceError::ReadFailed(e));
                break;
            }
        };

        let Some(packet) = packet_from_device(&buffer[..size]) else {
            continue;
        };
        trace!(len = packet.len(), "read packet from {}", iface.name());

        if tx.blocking_send(packet.to_vec()).is_err() {
            debug!("{} reader stopped: no consumer left", iface.name());
            break;
        }
    }
}

#[async_trait]
impl PacketInterface for TunInterface {
    async fn read_packets(&self) -> Option<Vec<Packet>> {
        let mut inbound = self.inbound.lock().await;
        recv_batch(&mut inbound).await
    }

    fn write_packets(
        &self,
        packets: &[Packet],
        family: AddressFamily,
    ) -> Result<(), InterfaceError> {
        for packet in packets {
            self.iface
                .send(&frame_for_device(packet, family))
                .map_err(InterfaceError::WriteFailed)?;
        }
        Ok(())
    }
}

/// In-process interface backed by channels
///
/// Packets pushed through the [`ChannelInterfaceHandle`] come out of
/// `read_packets`; packets written to the interface show up on the handle.
pub struct ChannelInterface {
    inbound: Mutex<mpsc::Receiver<Packet>>,
    outbound: mpsc::UnboundedSender<(Packet, AddressFamily)>,
}

/// The far side of a [`ChannelInterface`]
pub struct ChannelInterfaceHandle {
    inject: mpsc::Sender<Packet>,
    written: mpsc::UnboundedReceiver<(Packet, AddressFamily)>,
}

impl ChannelInterface {
    pub fn new(capacity: usize) -> (Self, ChannelInterfaceHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::unbounded_channel();
        let interface = ChannelInterface {
            inbound: Mutex::new(inbound),
            outbound,
        };
        (interface, ChannelInterfaceHandle { inject, written })
    }
}

#[async_trait]
impl PacketInterface for ChannelInterface {
    async fn read_packets(&self) -> Option<Vec<Packet>> {
        let mut inbound = self.inbound.lock().await;
        recv_batch(&mut inbound).await
    }

    fn write_packets(
        &self,
        packets: &[Packet],
        family: AddressFamily,
    ) -> Result<(), InterfaceError> {
        for packet in packets {
            self.outbound.send((packet.clone(), family)).map_err(|_| {
                InterfaceError::WriteFailed(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "interface handle dropped",
                ))
            })?;
        }
        Ok(())
    }
}

impl ChannelInterfaceHandle {
    /// Make `packet` readable from the interface. False once the interface is gone.
    pub async fn inject(&self, packet: Packet) -> bool {
        self.inject.send(packet).await.is_ok()
    }

    /// Next packet written to the interface
    pub async fn next_written(&mut self) -> Option<(Packet, AddressFamily)> {
        self.written.recv().await
    }

    /// Next written packet, if one is already waiting
    pub fn try_next_written(&mut self) -> Option<(Packet, AddressFamily)> {
        self.written.try_recv().ok()
    }

    /// End the interface's read side
    pub fn close_reads(self) -> mpsc::UnboundedReceiver<(Packet, AddressFamily)> {
        self.written
    }
}

/// Parse a CIDR notation to IP address and netmask
pub fn parse_cidr(
    cidr: &str,
) -> Result<(Ipv4Addr, Ipv4Addr), Box<dyn std::error::Error + Send + Sync>> {
    let (ip, prefix) = cidr.split_once('/').ok_or("Invalid CIDR format")?;

    let ip = Ipv4Addr::from_str(ip)?;
    let prefix_len: u8 = prefix.parse()?;

    if prefix_len > 32 {
        return Err("Invalid prefix length".into());
    }

    Ok((ip, prefix_to_netmask(prefix_len)))
}

/// Netmask for a prefix length of at most 32
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let netmask_value = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(netmask_value)
}

/// Calculate the number of bits in a netmask
pub fn netmask_bits(netmask: &Ipv4Addr) -> u8 {
    netmask.octets().iter().map(|octet| octet.count_ones() as u8).sum()
}

/// Configure the network interface (platform-specific)
#[cfg(target_os = "linux")]
fn configure_interface(
    name: &str,
    ip: &Ipv4Addr,
    netmask: &Ipv4Addr,
    mtu: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use std::process::Command;

    // `replace` keeps repeated starts from stacking addresses
    let status = Command::new("ip")
        .args(["addr", "replace", &format!("{}/{}", ip, netmask_bits(netmask)), "dev", name])
        .status()?;

    if !status.success() {
        return Err("Failed to set IP address".into());
    }

    let status = Command::new("ip")
        .args(["link", "set", "dev", name, "mtu", &mtu.to_string(), "up"])
        .status()?;

    if !status.success() {
        return Err("Failed to set MTU".into());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn configure_interface(
    _name: &str,
    _ip: &Ipv4Addr,
    _netmask: &Ipv4Addr,
    _mtu: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Err("TUN configuration is only implemented for Linux".into())
}
