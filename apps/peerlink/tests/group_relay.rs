use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{
    Path, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use peerlink_core::events::PeerEvent;
use peerlink_core::identity::{LocalIdentity, PeerId, PeerProfile};
use peerlink_core::network::PeerNetwork;
use peerlink_core::racer::Role;
use peerlink_core::rtc::loopback::LoopbackNetwork;
use peerlink_core::session::SessionState;
use peerlink_core::signaling::Heartbeat;
use peerlink_core::PeerConfig;

type Members = Vec<(u64, mpsc::UnboundedSender<WsMessage>)>;

/// Minimal group relay: fans every frame out to the other members of the
/// group and answers heartbeats with `PONG`.
#[derive(Clone, Default)]
struct RelayStub {
    groups: Arc<Mutex<HashMap<String, Members>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayStub {
    fn fan_out(&self, group: &str, from: u64, message: WsMessage) {
        let groups = self.groups.lock();
        for (id, tx) in groups.get(group).into_iter().flatten() {
            if *id != from {
                let _ = tx.send(message.clone());
            }
        }
    }

    fn leave(&self, group: &str, member: u64) {
        if let Some(members) = self.groups.lock().get_mut(group) {
            members.retain(|(id, _)| *id != member);
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<RelayStub>,
    Path(group): Path<String>,
) -> impl IntoResponse {
    debug!(%group, "stub: websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, relay, group))
}

async fn handle_socket(socket: WebSocket, relay: RelayStub, group: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let member = relay.next_id.fetch_add(1, Ordering::Relaxed);
    relay
        .groups
        .lock()
        .entry(group.clone())
        .or_default()
        .push((member, tx.clone()));

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => relay.fan_out(&group, member, WsMessage::Text(text)),
            WsMessage::Binary(data) => {
                if let Some(timestamp) = Heartbeat::decode(&data).and_then(|beat| beat.timestamp) {
                    let pong = json!({ "type": "PONG", "timestamp": timestamp });
                    let _ = tx.send(WsMessage::Text(pong.to_string()));
                }
                relay.fan_out(&group, member, WsMessage::Binary(data));
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    relay.leave(&group, member);
    send_task.abort();
}

async fn spawn_relay() -> String {
    let relay = RelayStub::default();
    let app = Router::new()
        .route("/group/:id", get(ws_handler))
        .with_state(relay);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay serve");
    });
    format!("ws://{addr}")
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn config(relay_url: &str) -> PeerConfig {
    PeerConfig {
        relay_url: relay_url.to_string(),
        discovery_url: None,
        cache_dir: None,
        relay_heartbeat: Duration::from_millis(100),
        descriptor_retry: Duration::from_millis(250),
        settle_timeout: Duration::from_millis(100),
        coalesce_idle: Duration::from_millis(20),
        session_heartbeat: Duration::from_millis(200),
        disconnect_grace: Duration::from_millis(200),
        port_hint: None,
        ..PeerConfig::default()
    }
}

fn peer(net: &LoopbackNetwork, relay_url: &str, byte: u8, name: &str) -> PeerNetwork {
    let identity = LocalIdentity::new(
        PeerId::from_bytes([byte; 16]),
        PeerProfile {
            name: name.to_string(),
            ..PeerProfile::default()
        },
    );
    PeerNetwork::with_identity(config(relay_url), Arc::new(net.clone()), None, identity)
}

async fn wait_connected(events: &mut broadcast::Receiver<PeerEvent>, remote: PeerId) -> String {
    timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(PeerEvent::ConnectionState {
                    session,
                    remote: Some(seen),
                    state: SessionState::Connected,
                }) if seen == remote => return session,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("connected in time")
}

#[test_timeout::tokio_timeout_test]
async fn group_members_connect_with_a_single_offerer() {
    init_tracing();
    let relay_url = spawn_relay().await;
    let net = LoopbackNetwork::new();
    let aaaa = peer(&net, &relay_url, 0xaa, "alex");
    let bbbb = peer(&net, &relay_url, 0xbb, "blair");
    let mut a_events = aaaa.subscribe();
    let mut b_events = bbbb.subscribe();

    assert_eq!(aaaa.join_group(Some("lobby".into())).await.expect("a joins"), "lobby");
    assert_eq!(bbbb.join_group(Some("lobby".into())).await.expect("b joins"), "lobby");

    let a_session = wait_connected(&mut a_events, bbbb.local_id()).await;
    let b_session = wait_connected(&mut b_events, aaaa.local_id()).await;
    assert_eq!(a_session, b_session);

    let a_side = aaaa.session(&a_session).expect("a session");
    let b_side = bbbb.session(&b_session).expect("b session");
    assert_eq!(b_side.role(), Role::Initiator);
    assert_eq!(a_side.role(), Role::Responder);
    assert_eq!(aaaa.sessions().len(), 1);
    assert_eq!(bbbb.sessions().len(), 1);

    timeout(Duration::from_secs(5), async {
        while a_side.remote_profile().map(|profile| profile.name) != Some("blair".into()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("identity exchanged");

    bbbb.leave_group().await.expect("b leaves");
    assert_eq!(b_side.state(), SessionState::Connected);
    assert!(bbbb.leave_group().await.is_err());

    aaaa.shutdown().await;
    bbbb.shutdown().await;
    assert!(aaaa.sessions().is_empty());
    assert!(bbbb.sessions().is_empty());
}
