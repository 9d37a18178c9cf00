mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use wsvpn::network::{
    AddressFamily, ChannelInterface, NetworkSettingsConfigurator, TunnelEndpoint, TunnelState,
};
use wsvpn::{NetworkConfig, TunnelError};

use common::{raw_listener, spawn_relay, wait_for_sessions, RecordingHost};

const WAIT: Duration = Duration::from_secs(5);

fn client_config(port: u16) -> NetworkConfig {
    NetworkConfig::with_remote("127.0.0.1", port)
}

#[tokio::test]
async fn client_packets_reach_the_relay_interface_unchanged_and_in_order() {
    let (relay_iface, mut relay_handle) = ChannelInterface::new(64);
    let relay = spawn_relay(relay_iface).await;

    let (client_iface, client_handle) = ChannelInterface::new(64);
    let host = RecordingHost::default();
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(client_iface),
        NetworkSettingsConfigurator::new(host.clone()),
    );
    endpoint.start(&client_config(relay.port)).await.unwrap();
    assert_eq!(endpoint.state(), TunnelState::Active);
    assert_eq!(host.commit_count(), 1);

    let packets: Vec<Vec<u8>> = [40usize, 60, 1400]
        .iter()
        .map(|len| (0..*len).map(|i| (i % 251) as u8).collect())
        .collect();
    for packet in &packets {
        assert!(client_handle.inject(packet.clone()).await);
    }

    for expected in &packets {
        let (written, family) = timeout(WAIT, relay_handle.next_written())
            .await
            .expect("relay interface saw nothing")
            .unwrap();
        assert_eq!(written.len(), expected.len());
        assert_eq!(&written, expected);
        assert_eq!(family, AddressFamily::Inet);
    }
    assert!(relay_handle.try_next_written().is_none());

    endpoint.stop().await;
    assert_eq!(endpoint.state(), TunnelState::Closed);
    assert_eq!(endpoint.stats().packets_sent, 3);
    assert_eq!(endpoint.stats().bytes_sent, 1500);
    wait_for_sessions(&relay.relay, 0).await;
    let _ = relay.stop.send(true);
}

#[tokio::test]
async fn relay_broadcast_reaches_both_clients() {
    let (relay_iface, relay_handle) = ChannelInterface::new(64);
    let relay = spawn_relay(relay_iface).await;

    let mut clients = Vec::new();
    for _ in 0..2 {
        let (iface, handle) = ChannelInterface::new(64);
        let mut endpoint = TunnelEndpoint::new(
            Arc::new(iface),
            NetworkSettingsConfigurator::new(RecordingHost::default()),
        );
        endpoint.start(&client_config(relay.port)).await.unwrap();
        clients.push((endpoint, handle));
    }
    wait_for_sessions(&relay.relay, 2).await;

    let packet: Vec<u8> = (100u8..128).collect();
    assert_eq!(packet.len(), 28);
    assert!(relay_handle.inject(packet.clone()).await);

    for (endpoint, handle) in clients.iter_mut() {
        let (received, family) = timeout(WAIT, handle.next_written())
            .await
            .expect("client interface saw nothing")
            .unwrap();
        assert_eq!(received, packet);
        assert_eq!(family, AddressFamily::Inet);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.try_next_written().is_none(), "packet delivered twice");
        assert_eq!(endpoint.stats().packets_received, 1);
    }

    for (mut endpoint, _handle) in clients {
        endpoint.stop().await;
    }
    let _ = relay.stop.send(true);
}

#[tokio::test]
async fn disconnected_clients_stop_receiving_broadcasts() {
    let (relay_iface, relay_handle) = ChannelInterface::new(64);
    let relay = spawn_relay(relay_iface).await;

    let (gone_iface, _gone_handle) = ChannelInterface::new(8);
    let mut gone = TunnelEndpoint::new(
        Arc::new(gone_iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );
    gone.start(&client_config(relay.port)).await.unwrap();

    let (kept_iface, mut kept_handle) = ChannelInterface::new(8);
    let mut kept = TunnelEndpoint::new(
        Arc::new(kept_iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );
    kept.start(&client_config(relay.port)).await.unwrap();
    wait_for_sessions(&relay.relay, 2).await;

    gone.stop().await;
    wait_for_sessions(&relay.relay, 1).await;
    for session in relay.relay.registry().snapshot() {
        assert!(session.is_open());
    }

    assert!(relay_handle.inject(vec![0x45; 20]).await);
    let (received, _) = timeout(WAIT, kept_handle.next_written()).await.unwrap().unwrap();
    assert_eq!(received, vec![0x45; 20]);
    assert_eq!(gone.stats().packets_received, 0);

    kept.stop().await;
    let _ = relay.stop.send(true);
}

#[tokio::test]
async fn receive_failure_ends_the_inbound_pump_without_reconnecting() {
    let (listener, port) = raw_listener().await;

    let (iface, _handle) = ChannelInterface::new(8);
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );
    let mut state = endpoint.subscribe();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        (listener, ws)
    });
    endpoint.start(&client_config(port)).await.unwrap();
    let (listener, ws) = accept.await.unwrap();

    // Tear the transport down without a closing handshake
    drop(ws);

    timeout(WAIT, state.wait_for(|s| *s == TunnelState::Closing))
        .await
        .expect("endpoint never noticed the failure")
        .unwrap();

    let retry = timeout(Duration::from_millis(500), listener.accept()).await;
    assert!(retry.is_err(), "endpoint tried to reconnect");

    assert_eq!(endpoint.state(), TunnelState::Closing);
    let alert = endpoint.last_alert().expect("no disconnect alert");
    assert!(alert.contains("Socket disconnected with code"));

    endpoint.stop().await;
    assert_eq!(endpoint.state(), TunnelState::Closed);
}

#[tokio::test]
async fn missing_remote_address_starts_nothing() {
    let (listener, _port) = raw_listener().await;

    let (iface, handle) = ChannelInterface::new(8);
    let host = RecordingHost::default();
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        NetworkSettingsConfigurator::new(host.clone()),
    );

    let err = endpoint.start(&NetworkConfig::default()).await.unwrap_err();
    assert!(matches!(err, TunnelError::Configuration(_)));
    assert_eq!(host.commit_count(), 0);
    assert_eq!(endpoint.state(), TunnelState::Closed);

    // No outbound pump is draining the interface
    assert!(handle.inject(vec![0x45; 20]).await);
    assert_eq!(endpoint.stats().packets_sent, 0);
    assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
}

#[tokio::test]
async fn text_messages_never_reach_the_interface() {
    let (listener, port) = raw_listener().await;

    let (iface, mut handle) = ChannelInterface::new(8);
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );

    let serve = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::text("relay diagnostics")).await.unwrap();
        ws.send(Message::Binary(vec![0x45u8; 28].into())).await.unwrap();
        ws
    });
    endpoint.start(&client_config(port)).await.unwrap();
    let _ws = serve.await.unwrap();

    let (packet, _) = timeout(WAIT, handle.next_written()).await.unwrap().unwrap();
    assert_eq!(packet, vec![0x45u8; 28]);
    assert!(handle.try_next_written().is_none());
    assert_eq!(endpoint.stats().control_messages, 1);

    endpoint.stop().await;
}

#[tokio::test]
async fn failed_sends_are_counted_and_the_pump_keeps_draining() {
    let (listener, port) = raw_listener().await;

    let (iface, handle) = ChannelInterface::new(8);
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );
    let mut state = endpoint.subscribe();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    endpoint.start(&client_config(port)).await.unwrap();
    let mut ws = accept.await.unwrap();

    ws.close(None).await.unwrap();
    timeout(WAIT, state.wait_for(|s| *s == TunnelState::Closing))
        .await
        .expect("endpoint never saw the close")
        .unwrap();

    // Well past the channel capacity: each inject only returns once the
    // outbound pump has taken an earlier packet off the interface
    timeout(WAIT, async {
        for _ in 0..50 {
            assert!(handle.inject(vec![0x45; 20]).await);
        }
    })
    .await
    .expect("outbound pump stopped draining the interface");

    timeout(WAIT, async {
        while endpoint.stats().send_failures < 42 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failed sends were not counted");
    assert_eq!(endpoint.stats().packets_sent, 0);

    endpoint.stop().await;
    assert_eq!(endpoint.state(), TunnelState::Closed);
}

#[tokio::test]
async fn stop_returns_when_the_relay_stops_reading() {
    let (listener, port) = raw_listener().await;

    let (iface, handle) = ChannelInterface::new(64);
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    endpoint.start(&client_config(port)).await.unwrap();
    // Held open but never polled, so the socket buffers fill up
    let _ws = accept.await.unwrap();

    let flood = tokio::spawn(async move {
        while handle.inject(vec![0x45; 1400]).await {}
    });

    // Wait until the outbound pump is stuck behind the full socket
    let mut last = 0;
    let mut steady = 0;
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = endpoint.stats().packets_sent;
        if sent > 0 && sent == last {
            steady += 1;
            if steady == 5 {
                break;
            }
        } else {
            steady = 0;
        }
        last = sent;
    }

    timeout(Duration::from_secs(10), endpoint.stop())
        .await
        .expect("stop hung behind a blocked send");
    assert_eq!(endpoint.state(), TunnelState::Closed);
    flood.abort();
}

#[tokio::test]
async fn dropping_a_started_endpoint_says_going_away() {
    let (listener, port) = raw_listener().await;

    let (iface, _handle) = ChannelInterface::new(8);
    let mut endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        NetworkSettingsConfigurator::new(RecordingHost::default()),
    );

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    endpoint.start(&client_config(port)).await.unwrap();
    let mut ws = accept.await.unwrap();

    drop(endpoint);

    match timeout(WAIT, ws.next()).await.expect("no close frame").unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("unexpected message {:?}", other),
    }
}
