//! Set of open relay sessions
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::network::session::{ConnectionSession, SessionEvent, SessionId, SessionObserver};

/// Sessions currently connected to the relay, keyed by identity.
///
/// Membership changes only on accept, close and transport failure. A session
/// whose close has been observed is never handed out again.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ConnectionSession>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Observer that drops sessions from this registry once they close
    pub fn observer(self: &Arc<Self>) -> Arc<dyn SessionObserver> {
        Arc::new(RegistryObserver {
            registry: Arc::downgrade(self),
        })
    }

    /// Register an open session. Closed sessions are refused.
    pub fn insert(&self, session: Arc<ConnectionSession>) -> bool {
        if !session.is_open() {
            return false;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.id(), session).is_none()
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ConnectionSession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open sessions, in iteration order
    pub fn snapshot(&self) -> Vec<Arc<ConnectionSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().filter(|s| s.is_open()).cloned().collect()
    }

    /// Offer `packet` once to every open session, one after another.
    ///
    /// No destination filtering: every client sees every packet. A slow
    /// session delays the ones iterated after it. Sessions whose send fails
    /// are dropped. Returns the number of sessions the packet reached.
    pub async fn broadcast(&self, packet: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.snapshot() {
            match session.send(packet).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        session = %session.id(),
                        "dropping packet of {} bytes: {}",
                        packet.len(),
                        e
                    );
                    self.remove(session.id());
                }
            }
        }
        delivered
    }

    /// Close every session with "going away" and empty the registry
    pub async fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close(CloseCode::Away, "relay shutting down").await;
        }
    }
}

struct RegistryObserver {
    registry: Weak<ConnectionRegistry>,
}

impl SessionObserver for RegistryObserver {
    fn on_event(&self, session: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::Opened => debug!(%session, "session opened"),
            SessionEvent::Closed { code, reason } => {
                info!(%session, code, %reason, "WebSocket client disconnected");
                if let Some(registry) = self.registry.upgrade() {
                    registry.remove(session);
                }
            }
            SessionEvent::Failed(error) => {
                warn!(%session, "WebSocket error: {}", error);
                if let Some(registry) = self.registry.upgrade() {
                    registry.remove(session);
                }
            }
        }
    }
}
