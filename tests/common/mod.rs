use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use wsvpn::network::settings::TunnelNetworkSettings;
use wsvpn::network::{ChannelInterface, HostConfigurator, PacketInterface, RelayServer};
use wsvpn::ConfigurationError;

/// Host that remembers every settings object it was asked to commit
#[derive(Clone, Default)]
pub struct RecordingHost {
    pub commits: Arc<Mutex<Vec<TunnelNetworkSettings>>>,
}

#[async_trait]
impl HostConfigurator for RecordingHost {
    async fn commit(
        &self,
        settings: &TunnelNetworkSettings,
        _previous: Option<&TunnelNetworkSettings>,
    ) -> Result<(), ConfigurationError> {
        self.commits.lock().unwrap().push(settings.clone());
        Ok(())
    }
}

impl RecordingHost {
    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }
}

/// A relay on a loopback port, backed by a channel interface
pub struct TestRelay {
    pub relay: Arc<RelayServer<ChannelInterface>>,
    pub port: u16,
    pub stop: watch::Sender<bool>,
}

pub async fn spawn_relay(interface: ChannelInterface) -> TestRelay {
    let listener = RelayServer::<ChannelInterface>::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = RelayServer::new(Arc::new(interface));
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&relay).run(listener, stop_rx));
    TestRelay { relay, port, stop }
}

pub async fn wait_for_sessions<I: PacketInterface>(relay: &RelayServer<I>, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.registry().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never reached the expected session count");
}

/// Listener that is not a relay at all, for watching connection attempts
pub async fn raw_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}
