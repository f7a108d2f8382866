use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use peerlink_core::events::PeerEvent;
use peerlink_core::identity::{LocalIdentity, PeerId, PeerProfile};
use peerlink_core::network::{InitiateOptions, PeerNetwork, TransferDescription};
use peerlink_core::rtc::loopback::{LoopbackNetwork, PathBehavior};
use peerlink_core::rtc::{IceServer, SdpKind};
use peerlink_core::session::SessionState;
use peerlink_core::{PeerConfig, PeerError};

fn config() -> PeerConfig {
    PeerConfig {
        discovery_url: None,
        cache_dir: None,
        settle_timeout: Duration::from_millis(100),
        coalesce_idle: Duration::from_millis(20),
        session_heartbeat: Duration::from_millis(200),
        disconnect_grace: Duration::from_millis(200),
        race_deadline: Duration::from_secs(1),
        reconnect_attempts: 0,
        relay_fallback: false,
        port_hint: None,
        ..PeerConfig::default()
    }
}

fn peer(net: &LoopbackNetwork, byte: u8) -> PeerNetwork {
    let identity = LocalIdentity::new(PeerId::from_bytes([byte; 16]), PeerProfile::default());
    PeerNetwork::with_identity(config(), Arc::new(net.clone()), None, identity)
}

async fn next_description(events: &mut broadcast::Receiver<PeerEvent>, session: &str) -> String {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PeerEvent::LocalDescription { session: id, description }) = events.recv().await {
                if id == session {
                    return description;
                }
            }
        }
    })
    .await
    .expect("description published")
}

async fn wait_state(events: &mut broadcast::Receiver<PeerEvent>, session: &str, wanted: SessionState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PeerEvent::ConnectionState { session: id, state, .. }) = events.recv().await {
                if id == session && state == wanted {
                    return;
                }
            }
        }
    })
    .await
    .expect("state reached");
}

#[test_timeout::tokio_timeout_test]
async fn pasted_offer_and_answer_connect_both_sides() {
    let net = LoopbackNetwork::new();
    let host = peer(&net, 0x11);
    let guest = peer(&net, 0x22);
    let mut host_events = host.subscribe();
    let mut guest_events = guest.subscribe();

    let session = host.initiate(InitiateOptions::default()).expect("initiate");
    let offer = next_description(&mut host_events, &session).await;
    let decoded = TransferDescription::decode(&offer).expect("offer decodes");
    assert_eq!(decoded.id, host.local_id());
    assert_eq!(decoded.session, session);
    assert!(decoded.connections.iter().all(|connection| connection.kind == SdpKind::Offer));

    assert_eq!(guest.set_remote_description(&offer).expect("apply offer"), session);
    let answer = next_description(&mut guest_events, &session).await;
    host.set_remote_description(&answer).expect("apply answer");

    wait_state(&mut host_events, &session, SessionState::Connected).await;
    wait_state(&mut guest_events, &session, SessionState::Connected).await;
    assert_eq!(guest.session(&session).and_then(|s| s.remote()), Some(host.local_id()));

    host.drop_session(&session).await.expect("drop");
    wait_state(&mut guest_events, &session, SessionState::Closed).await;
    assert!(host.session(&session).is_none());
    timeout(Duration::from_secs(2), async {
        while guest.session(&session).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("guest forgets the session");
}

#[test_timeout::tokio_timeout_test]
async fn malformed_and_orphaned_descriptions_are_rejected() {
    let net = LoopbackNetwork::new();
    let host = peer(&net, 0x11);
    let guest = peer(&net, 0x22);

    assert!(matches!(
        host.set_remote_description("not base64 at all!"),
        Err(PeerError::InvalidDescription(_))
    ));

    let mut guest_events = guest.subscribe();
    let session = host.initiate(InitiateOptions::default()).expect("initiate");
    let mut host_events = host.subscribe();
    let offer = next_description(&mut host_events, &session).await;
    guest.set_remote_description(&offer).expect("apply offer");
    let answer = next_description(&mut guest_events, &session).await;

    host.drop_session(&session).await.expect("drop");
    assert!(matches!(
        host.set_remote_description(&answer),
        Err(PeerError::UnknownSession(id)) if id == session
    ));
    assert!(matches!(
        host.drop_session(&session).await,
        Err(PeerError::UnknownSession(_))
    ));
}

async fn description_with(
    events: &mut broadcast::Receiver<PeerEvent>,
    session: &str,
    attempts: usize,
) -> TransferDescription {
    loop {
        let description = next_description(events, session).await;
        let transfer = TransferDescription::decode(&description).expect("decodes");
        if transfer.connections.len() >= attempts {
            return transfer;
        }
    }
}

fn only_attempt(transfer: &TransferDescription, attempt: u32) -> String {
    let mut single = transfer.clone();
    single.connections.retain(|connection| connection.attempt == attempt);
    assert_eq!(single.connections.len(), 1);
    single.encode().expect("encode")
}

#[test_timeout::tokio_timeout_test]
async fn late_offer_from_a_losing_attempt_keeps_the_link() {
    let net = LoopbackNetwork::new();
    net.set_behavior("turn:relay.test:3478", PathBehavior::Blackhole);
    let host = peer(&net, 0x11);
    let guest = peer(&net, 0x22);
    let mut host_events = host.subscribe();
    let mut guest_events = guest.subscribe();

    let session = host
        .initiate(InitiateOptions {
            ice_servers: vec![
                IceServer::stun("stun:stun.test:3478"),
                IceServer::turn("turn:relay.test:3478", "user", "secret"),
            ],
            ..InitiateOptions::default()
        })
        .expect("initiate");
    let offers = description_with(&mut host_events, &session, 2).await;

    guest
        .set_remote_description(&only_attempt(&offers, 0))
        .expect("apply first offer");
    let answer = next_description(&mut guest_events, &session).await;
    host.set_remote_description(&answer).expect("apply answer");
    wait_state(&mut host_events, &session, SessionState::Connected).await;
    wait_state(&mut guest_events, &session, SessionState::Connected).await;
    let established = guest.session(&session).expect("guest session");

    guest
        .set_remote_description(&only_attempt(&offers, 1))
        .expect("late offer is accepted for routing");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let current = guest.session(&session).expect("guest keeps the session");
    assert!(Arc::ptr_eq(&current, &established));
    assert_eq!(current.state(), SessionState::Connected);
    assert_eq!(
        host.session(&session).map(|session| session.state()),
        Some(SessionState::Connected)
    );
}

#[test_timeout::tokio_timeout_test]
async fn concurrent_initiations_with_one_id_share_a_session() {
    let net = LoopbackNetwork::new();
    let host = peer(&net, 0x11);
    let options = InitiateOptions {
        session: Some("fixed".into()),
        ..InitiateOptions::default()
    };

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let host = host.clone();
            let options = options.clone();
            tokio::spawn(async move { host.initiate(options) })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.expect("join").expect("initiate"), "fixed");
    }
    assert_eq!(host.sessions().len(), 1);
}
