//! In-process [`RtcFactory`] that pairs connections through their SDP.
//!
//! Every connection writes `loopback <id>` as its SDP, so applying a remote
//! description is enough to find the other end. Path behaviour is chosen per
//! ICE server url: connect after a latency, fail, or never connect. Channel
//! traffic is delivered in order after half the path latency.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    ChannelEvent, ChannelInit, ChannelMessage, ConnectionState, IceCandidate, IceServer,
    RtcConnection, RtcDataChannel, RtcEvent, RtcFactory, SdpKind, SessionDescription,
};
use crate::error::TransportError;

const FAIL_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathBehavior {
    Connect { latency: Duration },
    Fail,
    Blackhole,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetInner>,
}

#[derive(Default)]
struct NetInner {
    behaviors: Mutex<HashMap<String, PathBehavior>>,
    default_behavior: Mutex<Option<PathBehavior>>,
    reflexive: Mutex<HashMap<String, SocketAddr>>,
    connections: Mutex<HashMap<u64, Weak<LoopbackConnection>>>,
    created: Mutex<Vec<Arc<LoopbackConnection>>>,
    next_id: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, url: impl Into<String>, behavior: PathBehavior) {
        self.inner.behaviors.lock().insert(url.into(), behavior);
    }

    /// Behaviour for connections whose servers have none configured.
    /// Unset means connect immediately.
    pub fn set_default_behavior(&self, behavior: PathBehavior) {
        *self.inner.default_behavior.lock() = Some(behavior);
    }

    /// Makes gathering through `url` report `addr` as a server-reflexive candidate.
    pub fn set_reflexive(&self, url: impl Into<String>, addr: SocketAddr) {
        self.inner.reflexive.lock().insert(url.into(), addr);
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.inner.created.lock().clone()
    }
}

impl NetInner {
    fn behavior_for(&self, servers: &[IceServer]) -> PathBehavior {
        let behaviors = self.behaviors.lock();
        servers
            .iter()
            .find_map(|server| behaviors.get(&server.url).copied())
            .or(*self.default_behavior.lock())
            .unwrap_or(PathBehavior::Connect {
                latency: Duration::ZERO,
            })
    }
}

#[async_trait]
impl RtcFactory for LoopbackNetwork {
    async fn create_connection(
        &self,
        servers: &[IceServer],
        port_hint: Option<u16>,
    ) -> Result<Arc<dyn RtcConnection>, TransportError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let reflexive = {
            let table = self.inner.reflexive.lock();
            servers
                .iter()
                .filter_map(|server| table.get(&server.url).copied())
                .collect()
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let net = Arc::downgrade(&self.inner);
        let connection = Arc::new_cyclic(|me| LoopbackConnection {
            id,
            me: me.clone(),
            net,
            servers: servers.to_vec(),
            port: port_hint.unwrap_or_else(|| 40_000u16.wrapping_add(id as u16)),
            reflexive,
            state: Mutex::new(ConnInner::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        self.inner
            .connections
            .lock()
            .insert(id, Arc::downgrade(&connection));
        self.inner.created.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct LoopbackConnection {
    id: u64,
    me: Weak<LoopbackConnection>,
    net: Weak<NetInner>,
    servers: Vec<IceServer>,
    port: u16,
    reflexive: Vec<SocketAddr>,
    state: Mutex<ConnInner>,
    events_tx: mpsc::UnboundedSender<RtcEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RtcEvent>>>,
}

struct ConnInner {
    state: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<Weak<LoopbackConnection>>,
    channels: Vec<Arc<LoopbackChannel>>,
    latency: Option<Duration>,
}

impl Default for ConnInner {
    fn default() -> Self {
        Self {
            state: ConnectionState::New,
            local: None,
            remote: None,
            peer: None,
            channels: Vec::new(),
            latency: None,
        }
    }
}

impl LoopbackConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().state == ConnectionState::Closed
    }

    fn sdp(&self) -> String {
        format!("v=0\r\nloopback {}\r\n", self.id)
    }

    fn emit(&self, event: RtcEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut inner = self.state.lock();
            if inner.state == next || inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = next;
        }
        self.emit(RtcEvent::StateChanged(next));
    }

    fn gather(&self) {
        self.emit(RtcEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id, self.port
            ),
            mid: "0".into(),
        }));
        for (idx, addr) in self.reflexive.iter().enumerate() {
            self.emit(RtcEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{}{} 1 udp 1694498815 {} {} typ srflx raddr 127.0.0.1 rport {}",
                    self.id,
                    idx + 1,
                    addr.ip(),
                    addr.port(),
                    self.port
                ),
                mid: "0".into(),
            }));
        }
        self.emit(RtcEvent::GatheringComplete);
    }

    fn peer(&self) -> Option<Arc<LoopbackConnection>> {
        self.state.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    fn establish(offerer: Arc<LoopbackConnection>, answerer: Arc<LoopbackConnection>) {
        let behavior = offerer
            .net
            .upgrade()
            .map(|net| net.behavior_for(&offerer.servers))
            .unwrap_or(PathBehavior::Fail);
        tokio::spawn(async move {
            match behavior {
                PathBehavior::Connect { latency } => {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    if offerer.is_closed() || answerer.is_closed() {
                        return;
                    }
                    offerer.state.lock().latency = Some(latency);
                    answerer.state.lock().latency = Some(latency);
                    offerer.set_state(ConnectionState::Connected);
                    answerer.set_state(ConnectionState::Connected);
                    let pending: Vec<_> = offerer.state.lock().channels.clone();
                    for channel in pending {
                        pair_channel(&channel, &answerer, latency);
                    }
                    let pending: Vec<_> = answerer.state.lock().channels.clone();
                    for channel in pending {
                        pair_channel(&channel, &offerer, latency);
                    }
                }
                PathBehavior::Fail => {
                    tokio::time::sleep(FAIL_DELAY).await;
                    offerer.set_state(ConnectionState::Failed);
                    answerer.set_state(ConnectionState::Failed);
                }
                PathBehavior::Blackhole => {}
            }
        });
    }

    fn remote_closed(&self) {
        let state = self.state.lock().state;
        if state == ConnectionState::Connected || state == ConnectionState::Connecting {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

fn pair_channel(local: &Arc<LoopbackChannel>, remote_conn: &Arc<LoopbackConnection>, latency: Duration) {
    if local.linked.swap(true, Ordering::SeqCst) || local.closed.load(Ordering::SeqCst) {
        return;
    }
    let remote = LoopbackChannel::new(&local.label, &local.protocol);
    remote.linked.store(true, Ordering::SeqCst);
    remote_conn.state.lock().channels.push(Arc::clone(&remote));
    LoopbackChannel::link(local, &remote, latency / 2);
    remote_conn.emit(RtcEvent::DataChannel(Arc::clone(&remote) as Arc<dyn RtcDataChannel>));
    local.mark_open();
    remote.mark_open();
}

#[async_trait]
impl RtcConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let description = SessionDescription {
            sdp: self.sdp(),
            kind: SdpKind::Offer,
        };
        self.state.lock().local = Some(description.clone());
        self.gather();
        Ok(description)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        {
            let inner = self.state.lock();
            if inner.remote.as_ref().map(|remote| remote.kind) != Some(SdpKind::Offer) {
                return Err(TransportError::Negotiation(
                    "answer requires a remote offer".into(),
                ));
            }
        }
        let description = SessionDescription {
            sdp: self.sdp(),
            kind: SdpKind::Answer,
        };
        self.state.lock().local = Some(description.clone());
        self.gather();
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let token = description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix("loopback "))
            .and_then(|id| id.trim().parse::<u64>().ok())
            .ok_or_else(|| TransportError::Negotiation("not a loopback description".into()))?;
        let net = self.net.upgrade().ok_or(TransportError::Closed)?;
        let peer = net
            .connections
            .lock()
            .get(&token)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Negotiation(format!("unknown loopback peer {token}")))?;
        {
            let mut inner = self.state.lock();
            if inner.state == ConnectionState::Closed {
                return Err(TransportError::Closed);
            }
            inner.remote = Some(description.clone());
            inner.peer = Some(Arc::downgrade(&peer));
        }
        peer.state.lock().peer = Some(self.me.clone());
        self.set_state(ConnectionState::Connecting);
        if description.kind == SdpKind::Answer {
            peer.set_state(ConnectionState::Connecting);
            if let Some(me) = self.me.upgrade() {
                LoopbackConnection::establish(me, peer);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        let channel = LoopbackChannel::new(label, &init.protocol);
        let (connected, latency) = {
            let mut inner = self.state.lock();
            if inner.state == ConnectionState::Closed {
                return Err(TransportError::Closed);
            }
            inner.channels.push(Arc::clone(&channel));
            (inner.state == ConnectionState::Connected, inner.latency)
        };
        if connected {
            if let Some(peer) = self.peer() {
                pair_channel(&channel, &peer, latency.unwrap_or_default());
            }
        }
        Ok(channel)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>> {
        self.events_rx.lock().take()
    }

    fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    async fn close(&self) {
        let channels = {
            let mut inner = self.state.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            std::mem::take(&mut inner.channels)
        };
        self.emit(RtcEvent::StateChanged(ConnectionState::Closed));
        for channel in channels {
            channel.close_inner();
        }
        if let Some(peer) = self.peer() {
            peer.remote_closed();
        }
    }
}

enum Outbound {
    Message(ChannelMessage, Instant),
    Close(Instant),
}

pub struct LoopbackChannel {
    label: String,
    protocol: String,
    open: AtomicBool,
    closed: AtomicBool,
    linked: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    outbound: Mutex<Option<(mpsc::UnboundedSender<Outbound>, Duration)>>,
}

impl LoopbackChannel {
    fn new(label: &str, protocol: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            protocol: protocol.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            linked: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound: Mutex::new(None),
        })
    }

    fn link(a: &Arc<LoopbackChannel>, b: &Arc<LoopbackChannel>, one_way: Duration) {
        a.attach(Arc::clone(b), one_way);
        b.attach(Arc::clone(a), one_way);
    }

    fn attach(&self, dest: Arc<LoopbackChannel>, one_way: Duration) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        *self.outbound.lock() = Some((tx, one_way));
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Message(message, at) => {
                        tokio::time::sleep_until(at).await;
                        if !dest.closed.load(Ordering::SeqCst) {
                            let _ = dest.events_tx.send(ChannelEvent::Message(message));
                        }
                    }
                    Outbound::Close(at) => {
                        tokio::time::sleep_until(at).await;
                        dest.close_from_remote();
                        break;
                    }
                }
            }
        });
    }

    fn mark_open(&self) {
        if !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Close);
        if let Some((tx, one_way)) = self.outbound.lock().take() {
            let _ = tx.send(Outbound::Close(Instant::now() + one_way));
        }
    }

    fn close_from_remote(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Close);
        self.outbound.lock().take();
    }
}

#[async_trait]
impl RtcDataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let guard = self.outbound.lock();
        let (tx, one_way) = guard.as_ref().ok_or(TransportError::ChannelClosed)?;
        tx.send(Outbound::Message(message, Instant::now() + *one_way))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        self.close_inner();
    }
}
