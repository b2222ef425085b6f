//! Drives two client peers against an in-process relay: endpoint failover,
//! token registration, accept, a routed application message and teardown.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k9::assert_equal;
use tokio_util::sync::CancellationToken;

use tether_client::{
    BackoffPolicy, Connection, MessageRouter, ReconnectSupervisor, SignalEvent, SignalingClient,
    SupervisorState, TransportConfig,
};
use tether_proto::{ApplicationMessage, MessageKind, MouseMove};
use tether_relay::config::RelayConfig;
use tether_relay::{heartbeat_checker, http, State};

async fn spawn_relay() -> SocketAddr {
    let state = Arc::new(State::new(RelayConfig {
        shared_token: Some("shared".to_string()),
        ..RelayConfig::default()
    }));
    tokio::spawn(heartbeat_checker(state.clone(), CancellationToken::new()));
    let (addr, server) = warp::serve(http::routes(state)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn quick_policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: 1,
        jitter: 0.0,
    }
}

async fn next_event(conn: &mut Connection, signaling: &mut SignalingClient) -> SignalEvent {
    let envelope = tokio::time::timeout(Duration::from_secs(5), conn.next_envelope())
        .await
        .expect("timed out waiting for the relay")
        .expect("connection closed");
    signaling.on_envelope(&envelope)
}

#[tokio::test]
async fn token_pairing_carries_application_messages() {
    let addr = spawn_relay().await;
    let good = format!("ws://{}/ws/peer", addr);
    let shutdown = CancellationToken::new();

    // The first endpoint refuses connections; the supervisor moves on.
    let supervisor = ReconnectSupervisor::new(
        "host",
        vec!["ws://127.0.0.1:1/ws/peer".to_string(), good.clone()],
        quick_policy(),
        TransportConfig::default(),
        shutdown.clone(),
    );
    let mut host = supervisor.connect().await.expect("host should connect");
    assert_equal!(
        supervisor.state(),
        SupervisorState::Connected {
            endpoint: good.clone()
        }
    );
    let mut host_sig = SignalingClient::new("host");

    host.send_envelope(&host_sig.register_token("pair-123").unwrap())
        .await
        .unwrap();
    assert_equal!(
        next_event(&mut host, &mut host_sig).await,
        SignalEvent::TokenRegistered {
            accepted: true,
            reason: None
        }
    );

    let mut viewer = ReconnectSupervisor::new(
        "viewer",
        vec![good.clone()],
        quick_policy(),
        TransportConfig::default(),
        shutdown.clone(),
    )
    .connect()
    .await
    .expect("viewer should connect");
    let mut viewer_sig = SignalingClient::new("viewer");

    let connect = viewer_sig.request_by_token("pair-123").unwrap();
    let conn_id = connect.connection_id.clone();
    viewer.send_envelope(&connect).await.unwrap();

    match next_event(&mut host, &mut host_sig).await {
        SignalEvent::IncomingRequest {
            connection_id,
            request,
        } => {
            assert_equal!(connection_id, conn_id.clone());
            assert_equal!(request.requester_id.as_str(), "viewer");
        }
        other => panic!("expected an incoming request, got {:?}", other),
    }
    host.send_envelope(&host_sig.accept(&conn_id).unwrap())
        .await
        .unwrap();
    assert_equal!(
        next_event(&mut viewer, &mut viewer_sig).await,
        SignalEvent::Accepted {
            connection_id: conn_id.clone(),
            peer_id: Some("host".to_string()),
        }
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut router = MessageRouter::new();
    {
        let seen = seen.clone();
        router.register_handler(MessageKind::MouseMove, move |m| {
            if let ApplicationMessage::MouseMove(mv) = m {
                seen.lock().unwrap().push((mv.x, mv.y));
            }
            Ok(())
        });
    }

    let msg: ApplicationMessage = MouseMove::new(12, 34).into();
    viewer
        .send_envelope(&viewer_sig.message(&conn_id, &msg).unwrap())
        .await
        .unwrap();
    match next_event(&mut host, &mut host_sig).await {
        SignalEvent::Payload(envelope) => {
            let outcome = router.dispatch_envelope(&envelope).unwrap().unwrap();
            assert!(outcome.handled);
            assert_equal!(outcome.failures, 0);
        }
        other => panic!("expected a payload, got {:?}", other),
    }
    assert_equal!(*seen.lock().unwrap(), vec![(12, 34)]);

    host.send_envelope(&host_sig.disconnect(&conn_id, "bye").unwrap())
        .await
        .unwrap();
    match next_event(&mut viewer, &mut viewer_sig).await {
        SignalEvent::Closed { connection_id, .. } => {
            assert_equal!(connection_id, conn_id);
        }
        other => panic!("expected close, got {:?}", other),
    }

    host.dispose().await;
    viewer.dispose().await;
    shutdown.cancel();
}

#[tokio::test]
async fn duplicate_peer_id_is_a_failed_connection() {
    let addr = spawn_relay().await;
    let endpoint = format!("ws://{}/ws/peer", addr);
    let shutdown = CancellationToken::new();

    let mut first = Connection::new("dup", endpoint.clone());
    first
        .connect(&TransportConfig::default(), &shutdown)
        .await
        .unwrap();

    let mut second = Connection::new("dup", endpoint);
    let mut status = second.watch_status();
    second
        .connect(&TransportConfig::default(), &shutdown)
        .await
        .unwrap();
    // The relay closes the duplicate right after the upgrade.
    assert!(tokio::time::timeout(Duration::from_secs(5), second.next_envelope())
        .await
        .unwrap()
        .is_none());
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_terminal()))
        .await
        .unwrap()
        .unwrap();

    first.dispose().await;
    second.dispose().await;
}
