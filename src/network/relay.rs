//! Relay side of the tunnel
//!
//! The relay owns one virtual interface. Whatever arrives on a session is
//! written to the interface; whatever the interface produces is broadcast to
//! every open session.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::network::interface::{AddressFamily, PacketInterface};
use crate::network::registry::ConnectionRegistry;
use crate::network::session::{ConnectionSession, Frame};

/// Pending connections the listener queues before accepting
const LISTEN_BACKLOG: i32 = 1024;

/// Bridges one interface with any number of WebSocket sessions
pub struct RelayServer<I> {
    interface: Arc<I>,
    registry: Arc<ConnectionRegistry>,
}

impl<I: PacketInterface> RelayServer<I> {
    pub fn new(interface: Arc<I>) -> Arc<Self> {
        Arc::new(RelayServer {
            interface,
            registry: ConnectionRegistry::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind a listening socket with address reuse enabled
    pub fn bind(addr: SocketAddr) -> Result<TcpListener, TransportError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!("Server is listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept sessions and run the broadcast pump until `stop` fires.
    ///
    /// Connection tasks still handshaking or serving are cancelled on the way
    /// out, then every remaining session is closed with "going away".
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        let pump = tokio::spawn(Arc::clone(&self).broadcast_pump());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = Arc::clone(&self);
                        connections.spawn(async move { relay.handle_tcp(stream, peer).await });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        pump.abort();
        connections.shutdown().await;
        self.registry.close_all().await;
        info!("Relay stopped");
    }

    /// Interface → every session, until the interface read side ends
    pub async fn broadcast_pump(self: Arc<Self>) {
        while let Some(packets) = self.interface.read_packets().await {
            for packet in packets {
                debug!("Received packet from TUN interface ({} bytes)", packet.len());
                let delivered = self.registry.broadcast(&packet).await;
                if delivered == 0 {
                    debug!("No session to deliver {} bytes to", packet.len());
                }
            }
        }
        info!("Interface read side closed, broadcast pump done");
    }

    async fn handle_tcp(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
        };
        self.serve(ws, Some(peer)).await;
    }

    /// Register a session over `ws` and pump its packets onto the interface
    /// until it closes
    pub async fn serve<S>(&self, ws: WebSocketStream<S>, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, mut receiver) =
            ConnectionSession::from_stream(ws, peer, self.registry.observer());
        let id = session.id();
        match peer {
            Some(peer) => info!(session = %id, "WebSocket client connected from {}", peer),
            None => info!(session = %id, "WebSocket client connected"),
        }
        self.registry.insert(session);

        loop {
            match receiver.next_frame().await {
                Ok(Some(Frame::Packet(packet))) => {
                    debug!(
                        session = %id,
                        "Received packet from WebSocket client ({} bytes)",
                        packet.len()
                    );
                    if let Err(e) = self.interface.write_packets(&[packet], AddressFamily::Inet) {
                        warn!(session = %id, "Dropping packet: {}", e);
                    }
                }
                Ok(Some(Frame::Control(text))) => {
                    info!(session = %id, "Received string message: {}", text);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(session = %id, "receive loop ended: {}", e);
                    break;
                }
            }
        }

        self.registry.remove(id);
    }
}
