//! Client side of the tunnel
//!
//! A [`TunnelEndpoint`] owns one WebSocket session to the relay and two
//! independent pumps:
//!
//! - outbound: interface → session, one binary message per packet
//! - inbound: session → interface, binary payloads only
//!
//! Sends are best effort. A failed send drops that packet and the outbound
//! pump carries on. A failed receive ends the inbound pump for good; the
//! endpoint does not reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::TunnelError;
use crate::network::interface::{AddressFamily, PacketInterface};
use crate::network::session::{
    ConnectionSession, Frame, SessionEvent, SessionId, SessionObserver, SessionReceiver,
};
use crate::network::settings::{HostConfigurator, NetworkSettingsConfigurator};

/// Tunnel lifecycle. There is no way back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Tunnel statistics
#[derive(Debug, Default)]
pub struct TunnelStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    control_messages: AtomicU64,
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub control_messages: u64,
}

impl TunnelStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {} pkts / {} bytes ({} dropped), RX: {} pkts / {} bytes, {} control messages",
            self.packets_sent,
            self.bytes_sent,
            self.send_failures,
            self.packets_received,
            self.bytes_received,
            self.control_messages
        )
    }
}

/// Moves the endpoint to `Closing` when the session goes away underneath it
struct EndpointObserver {
    state: Arc<watch::Sender<TunnelState>>,
    last_alert: Arc<Mutex<Option<String>>>,
}

impl SessionObserver for EndpointObserver {
    fn on_event(&self, session: SessionId, event: SessionEvent) {
        let code = match event {
            SessionEvent::Opened => {
                info!(%session, "WebSocket did open");
                return;
            }
            SessionEvent::Closed { code, reason } => {
                info!(%session, code, %reason, "WebSocket did close");
                code
            }
            SessionEvent::Failed(error) => {
                warn!(%session, "WebSocket failed: {}", error);
                crate::network::session::ABNORMAL_CLOSURE
            }
        };

        let alert =
            serde_json::json!({ "alert": format!("Socket disconnected with code: {}", code) });
        info!("{}", alert);
        *self.last_alert.lock().unwrap_or_else(|e| e.into_inner()) = Some(alert.to_string());

        self.state.send_if_modified(|state| {
            if *state == TunnelState::Active {
                *state = TunnelState::Closing;
                true
            } else {
                false
            }
        });
    }
}

/// Session handle, stop signal and pump tasks of a running tunnel
struct ActiveTunnel {
    session: Arc<ConnectionSession>,
    stop: watch::Sender<bool>,
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl Drop for ActiveTunnel {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.outbound.abort();
        self.inbound.abort();

        // Best effort "going away" for endpoints dropped without stop()
        if self.session.is_open() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let session = Arc::clone(&self.session);
                runtime.spawn(async move { session.close(CloseCode::Away, "").await });
            }
        }
    }
}

/// Client endpoint pairing a local interface with one relay session
pub struct TunnelEndpoint<I, H> {
    interface: Arc<I>,
    configurator: NetworkSettingsConfigurator<H>,
    state: Arc<watch::Sender<TunnelState>>,
    stats: Arc<TunnelStats>,
    last_alert: Arc<Mutex<Option<String>>>,
    active: Option<ActiveTunnel>,
}

impl<I, H> TunnelEndpoint<I, H>
where
    I: PacketInterface,
    H: HostConfigurator,
{
    pub fn new(interface: Arc<I>, configurator: NetworkSettingsConfigurator<H>) -> Self {
        let (state, _) = watch::channel(TunnelState::Idle);
        TunnelEndpoint {
            interface,
            configurator,
            state: Arc::new(state),
            stats: Arc::new(TunnelStats::default()),
            last_alert: Arc::new(Mutex::new(None)),
            active: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// JSON alert describing the last disconnect, if there was one
    pub fn last_alert(&self) -> Option<String> {
        self.last_alert.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Identity of the current session
    pub fn session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|active| active.session.id())
    }

    /// Apply the network settings, connect to the relay, start both pumps.
    ///
    /// If the settings cannot be applied no connection is made and no pump
    /// runs. An endpoint starts at most once.
    pub async fn start(&mut self, config: &NetworkConfig) -> Result<(), TunnelError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == TunnelState::Idle {
                *state = TunnelState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(TunnelError::AlreadyStarted);
        }

        if let Err(e) = self.configurator.apply(config).await {
            error!("Error setting tunnel network settings: {}", e);
            self.state.send_replace(TunnelState::Closed);
            return Err(e.into());
        }

        let url = match config.relay_url() {
            Ok(url) => url,
            Err(e) => {
                self.state.send_replace(TunnelState::Closed);
                return Err(e.into());
            }
        };
        info!("WebSocket connecting to {}", url);

        let observer = Arc::new(EndpointObserver {
            state: Arc::clone(&self.state),
            last_alert: Arc::clone(&self.last_alert),
        });
        let (session, receiver) = match ConnectionSession::connect(&url, observer).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to connect to {}: {}", url, e);
                self.state.send_replace(TunnelState::Closed);
                return Err(e.into());
            }
        };

        let (stop, stop_rx) = watch::channel(false);
        let outbound = tokio::spawn(outbound_pump(
            Arc::clone(&self.interface),
            Arc::clone(&session),
            Arc::clone(&self.stats),
            stop_rx.clone(),
        ));
        let inbound = tokio::spawn(inbound_pump(
            Arc::clone(&self.interface),
            receiver,
            Arc::clone(&self.stats),
            Arc::clone(&self.state),
            stop_rx,
        ));

        self.active = Some(ActiveTunnel {
            session,
            stop,
            outbound,
            inbound,
        });

        // The session may already have failed between connect and here
        self.state.send_if_modified(|state| {
            if *state == TunnelState::Connecting {
                *state = TunnelState::Active;
                true
            } else {
                false
            }
        });
        info!("Tunnel to {} is up", url);
        Ok(())
    }

    /// Stop both pumps and close the session with "going away".
    ///
    /// A send already under way is cancelled, and the close frame is given up
    /// on if the relay has stopped reading. Dropping a started endpoint
    /// without calling this still attempts the close from a spawned task.
    pub async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            self.state.send_if_modified(|state| {
                if *state == TunnelState::Idle {
                    *state = TunnelState::Closed;
                    true
                } else {
                    false
                }
            });
            return;
        };

        self.state.send_replace(TunnelState::Closing);
        let _ = active.stop.send(true);

        // A send blocked on a peer that stopped reading holds the sink, so the
        // outbound pump is cancelled rather than waited for
        active.outbound.abort();
        for pump in [&mut active.outbound, &mut active.inbound] {
            if let Err(e) = pump.await {
                if !e.is_cancelled() {
                    error!("tunnel pump panicked: {}", e);
                }
            }
        }
        active.session.close(CloseCode::Away, "").await;

        self.state.send_replace(TunnelState::Closed);
        info!("Tunnel stopped: {}", self.stats.snapshot().format());
    }
}

/// Interface → session. Ends when the interface read side ends or on stop.
async fn outbound_pump<I: PacketInterface>(
    interface: Arc<I>,
    session: Arc<ConnectionSession>,
    stats: Arc<TunnelStats>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let packets = tokio::select! {
            _ = stop.changed() => break,
            packets = interface.read_packets() => packets,
        };
        let Some(packets) = packets else {
            info!("Interface read side closed, outbound pump done");
            break;
        };

        for packet in packets {
            match session.send(&packet).await {
                Ok(()) => {
                    trace!(len = packet.len(), "sent packet");
                    stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Error sending packet: {}", e);
                    stats.send_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    debug!("outbound pump stopped");
}

/// Session → interface. A receive failure ends it; nothing reconnects.
async fn inbound_pump<I: PacketInterface>(
    interface: Arc<I>,
    mut receiver: SessionReceiver,
    stats: Arc<TunnelStats>,
    state: Arc<watch::Sender<TunnelState>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = receiver.next_frame() => frame,
        };

        match frame {
            Ok(Some(Frame::Packet(packet))) => {
                trace!(len = packet.len(), "received packet");
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                stats.bytes_received.fetch_add(packet.len() as u64, Ordering::Relaxed);
                if let Err(e) = interface.write_packets(&[packet], AddressFamily::Inet) {
                    warn!("Dropping received packet: {}", e);
                }
            }
            Ok(Some(Frame::Control(text))) => {
                stats.control_messages.fetch_add(1, Ordering::Relaxed);
                info!("Received string message: {}", text);
            }
            Ok(None) => {
                info!("Relay closed the session, inbound pump done");
                break;
            }
            Err(e) => {
                // No reconnection: the tunnel stays down until restarted
                error!("Error receiving message: {}", e);
                break;
            }
        }
    }

    state.send_if_modified(|state| {
        if *state == TunnelState::Active {
            *state = TunnelState::Closing;
            true
        } else {
            false
        }
    });
    debug!("inbound pump stopped");
}
