//! WebSocket sessions carrying tunnel packets
//!
//! Every binary message is exactly one raw IP packet. Text messages are
//! out-of-band diagnostics. A session is split into a [`ConnectionSession`]
//! (identity, state, serialized send half) and a [`SessionReceiver`] owned by
//! whichever pump reads from it.

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProtocolError, TransportError};
use crate::network::interface::Packet;

/// Close code reported when the peer vanished without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported when the close frame carried no status
pub const NO_STATUS: u16 = 1005;

/// How long a close frame may wait behind a peer that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Identity of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connected = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connected,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Lifecycle events delivered to a [`SessionObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Closed { code: u16, reason: String },
    Failed(String),
}

/// Receives session lifecycle events, synchronously, from the session itself.
///
/// A session reports `Opened` once and then exactly one of `Closed` or
/// `Failed`.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, session: SessionId, event: SessionEvent);
}

/// Observer that only logs
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_event(&self, session: SessionId, event: SessionEvent) {
        debug!(%session, ?event, "session event");
    }
}

/// One unit read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    Control(String),
}

/// Send half and state of one WebSocket connection
pub struct ConnectionSession {
    id: SessionId,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    sink: Mutex<FrameSink>,
    observer: Arc<dyn SessionObserver>,
}

impl ConnectionSession {
    /// Wrap an established WebSocket stream
    pub fn from_stream<S>(
        ws: WebSocketStream<S>,
        peer: Option<SocketAddr>,
        observer: Arc<dyn SessionObserver>,
    ) -> (Arc<Self>, SessionReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split::<Message>();
        let session = Arc::new(ConnectionSession {
            id: SessionId::new(),
            peer,
            state: AtomicU8::new(SessionState::Connected as u8),
            sink: Mutex::new(Box::pin(sink)),
            observer,
        });

        session.observer.on_event(session.id, SessionEvent::Opened);

        let receiver = SessionReceiver {
            session: Arc::clone(&session),
            stream: Box::pin(stream),
        };
        (session, receiver)
    }

    /// Open a client session to `url`
    pub async fn connect(
        url: &str,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<(Arc<Self>, SessionReceiver), TransportError> {
        let (ws, _response) = connect_async(url).await?;
        info!("WebSocket connected to {}", url);
        Ok(Self::from_stream(ws, None, observer))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Send one packet as a binary message
    pub async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        self.send_message(Message::Binary(packet.to_vec().into())).await
    }

    /// Send an out-of-band diagnostic string
    pub async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send_message(Message::text(text)).await
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(self.id));
        }

        // Holding the sink across the whole send keeps frames from interleaving
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(message).await {
            self.finish(SessionEvent::Failed(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Start the closing handshake. Does nothing unless the session is connected.
    ///
    /// The session ends up `Closed` even when the close frame cannot be
    /// written within [`CLOSE_TIMEOUT`].
    pub async fn close(&self, code: CloseCode, reason: &'static str) {
        let claimed = self
            .state
            .compare_exchange(
                SessionState::Connected as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !claimed {
            return;
        }

        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        let delivery = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Close(Some(frame))).await
        })
        .await;
        match delivery {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session = %self.id, "close frame not delivered: {}", e),
            Err(_) => warn!(session = %self.id, "peer not reading, close frame abandoned"),
        }

        self.finish(SessionEvent::Closed {
            code: code.into(),
            reason: reason.to_string(),
        });
    }

    /// Move to `Closed`, notifying the observer the first time only
    fn finish(&self, event: SessionEvent) {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous != SessionState::Closed as u8 {
            self.observer.on_event(self.id, event);
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Receive half of a session
pub struct SessionReceiver {
    session: Arc<ConnectionSession>,
    stream: FrameStream,
}

impl SessionReceiver {
    /// Wait for the next packet or control string.
    ///
    /// `Ok(None)` means the connection closed; an error means the transport
    /// failed. Either way the session is `Closed` afterwards.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))
                | None => {
                    self.session.finish(SessionEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection dropped".to_string(),
                    });
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.session.finish(SessionEvent::Failed(e.to_string()));
                    return Err(e.into());
                }
            };

            match message {
                Message::Binary(data) if data.is_empty() => {
                    warn!(
                        session = %self.session.id,
                        "discarding message: {}",
                        ProtocolError::EmptyPacket
                    );
                }
                Message::Binary(data) => return Ok(Some(Frame::Packet(data.to_vec()))),
                Message::Text(text) => return Ok(Some(Frame::Control(text.as_str().to_owned()))),
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((NO_STATUS, String::new()));
                    self.session.finish(SessionEvent::Closed { code, reason });
                    return Ok(None);
                }
                Message::Frame(_) => {
                    warn!(
                        session = %self.session.id,
                        "discarding message: {}",
                        ProtocolError::UnexpectedFrame("websocket")
                    );
                }
            }
        }
    }
}
