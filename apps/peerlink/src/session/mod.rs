//! The long-lived side of a connection: the `metadata` control channel,
//! heartbeats, LAN tunnels and file streaming over one promoted attempt.

pub mod messages;
pub mod registry;
pub mod transfer;
pub mod tunnel;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::error::{PeerError, ProtocolError, TransportError};
use crate::events::PeerEvent;
use crate::identity::{LocalIdentity, PeerId, PeerProfile};
use crate::racer::{PING_PROTOCOL, Role, Winner};
use crate::rtc::{
    ChannelEvent, ChannelInit, ChannelMessage, ConnectionState, RtcConnection, RtcDataChannel,
    RtcEvent, send_text,
};
use crate::signaling::protocol::unix_millis;

use messages::{LanServer, Message, SharedManifest};
use transfer::{DOWNLOAD_PROTOCOL, SharedInstance};
use tunnel::{ChannelOpener, ProxyPool, ServerProxy, TUNNEL_PROTOCOL, TunnelSet};

pub const CONTROL_PROTOCOL: &str = "metadata";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// How a link stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEnd {
    /// `close()` was called.
    Dropped,
    /// The transport or the control channel went away on its own.
    Lost(String),
}

/// Process-wide collaborators shared by every session.
pub struct SessionContext {
    pub config: PeerConfig,
    pub identity: Arc<LocalIdentity>,
    pub sharing: SharedInstance,
    pub lan_servers: RwLock<Vec<LanServer>>,
    pub events: broadcast::Sender<PeerEvent>,
    pub downloads: Semaphore,
}

impl SessionContext {
    pub fn new(
        config: PeerConfig,
        identity: Arc<LocalIdentity>,
        events: broadcast::Sender<PeerEvent>,
    ) -> Self {
        let downloads = Semaphore::new(config.download_concurrency.max(1));
        Self {
            config,
            identity,
            sharing: SharedInstance::default(),
            lan_servers: RwLock::new(Vec::new()),
            events,
            downloads,
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

struct Link {
    connection: Arc<dyn RtcConnection>,
    control: Option<Arc<dyn RtcDataChannel>>,
}

pub struct PeerSession {
    id: String,
    role: Role,
    context: Arc<SessionContext>,
    remote: RwLock<Option<PeerId>>,
    remote_profile: RwLock<Option<PeerProfile>>,
    remote_manifest: RwLock<Option<SharedManifest>>,
    latency: RwLock<Option<Duration>>,
    state: watch::Sender<SessionState>,
    closing: watch::Sender<bool>,
    running: AtomicBool,
    link: Mutex<Option<Link>>,
    proxies: ProxyPool,
    tunnels: Arc<TunnelSet>,
    serving: Mutex<Vec<AbortHandle>>,
}

impl PeerSession {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        remote: Option<PeerId>,
        context: Arc<SessionContext>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::New);
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            role,
            context,
            remote: RwLock::new(remote),
            remote_profile: RwLock::new(None),
            remote_manifest: RwLock::new(None),
            latency: RwLock::new(None),
            state,
            closing,
            running: AtomicBool::new(false),
            link: Mutex::new(None),
            proxies: ProxyPool::default(),
            tunnels: Arc::new(TunnelSet::default()),
            serving: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> Option<PeerId> {
        *self.remote.read()
    }

    pub fn set_remote(&self, remote: PeerId) {
        *self.remote.write() = Some(remote);
    }

    pub fn remote_profile(&self) -> Option<PeerProfile> {
        self.remote_profile.read().clone()
    }

    pub fn remote_manifest(&self) -> Option<SharedManifest> {
        self.remote_manifest.read().clone()
    }

    pub fn latency(&self) -> Option<Duration> {
        *self.latency.read()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// `(remote_port, local_port)` of every LAN proxy.
    pub fn proxy_ports(&self) -> Vec<(u16, u16)> {
        self.proxies.ports()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Closed is final; every other change is published.
    pub(crate) fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next || *state == SessionState::Closed {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(target = "peerlink::session", session = %self.id, state = ?next, "session state");
            self.context.emit(PeerEvent::ConnectionState {
                session: self.id.clone(),
                remote: self.remote(),
                state: next,
            });
        }
    }

    /// Drives the promoted attempt until it is dropped or lost. On a loss
    /// the session stays registered and keeps its state; the caller decides
    /// between reconnecting and [`PeerSession::finish`].
    pub async fn run(self: &Arc<Self>, winner: Winner) -> LinkEnd {
        let Winner {
            attempt,
            connection,
            mut events,
            ping,
            pending_channels,
            latency,
            ..
        } = winner;
        self.running.store(true, Ordering::SeqCst);
        let mut closing = self.closing.subscribe();
        if *closing.borrow() {
            connection.close().await;
            self.running.store(false, Ordering::SeqCst);
            self.finish().await;
            return LinkEnd::Dropped;
        }
        if let Some(latency) = latency {
            *self.latency.write() = Some(latency);
        }
        if let Some(ping) = ping {
            ping.close().await;
        }
        self.set_state(SessionState::Connecting);
        info!(target = "peerlink::session", session = %self.id, attempt, role = ?self.role, "link promoted");

        let mut control_events = None;
        if self.role == Role::Initiator {
            let created = connection
                .create_data_channel(&self.id, ChannelInit::ordered(CONTROL_PROTOCOL))
                .await;
            match created {
                Ok(control) => {
                    control_events = control.take_events();
                    *self.link.lock() = Some(Link {
                        connection: Arc::clone(&connection),
                        control: Some(control),
                    });
                }
                Err(err) => {
                    connection.close().await;
                    self.running.store(false, Ordering::SeqCst);
                    return LinkEnd::Lost(err.to_string());
                }
            }
        } else {
            *self.link.lock() = Some(Link {
                connection: Arc::clone(&connection),
                control: None,
            });
        }
        for channel in pending_channels {
            self.on_channel(channel, &mut control_events);
        }

        let mut heartbeat = tokio::time::interval(self.context.config.session_heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut grace: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                changed = closing.changed() => {
                    if changed.is_err() || *closing.borrow() {
                        break LinkEnd::Dropped;
                    }
                }
                event = events.recv() => match event {
                    Some(RtcEvent::DataChannel(channel)) => self.on_channel(channel, &mut control_events),
                    Some(RtcEvent::StateChanged(state)) => match state {
                        ConnectionState::Connected => grace = None,
                        ConnectionState::Disconnected => {
                            let deadline = Instant::now() + self.context.config.disconnect_grace;
                            grace.get_or_insert(deadline);
                        }
                        ConnectionState::Failed | ConnectionState::Closed => {
                            break LinkEnd::Lost(format!("transport {state:?}"));
                        }
                        ConnectionState::New | ConnectionState::Connecting => {}
                    },
                    Some(RtcEvent::LocalCandidate(_)) | Some(RtcEvent::GatheringComplete) => {}
                    None => break LinkEnd::Lost("transport events ended".into()),
                },
                event = recv_optional(&mut control_events) => match event {
                    Some(ChannelEvent::Open) => self.on_control_open().await,
                    Some(ChannelEvent::Message(ChannelMessage::Text(text))) => self.on_control_text(&text).await,
                    Some(ChannelEvent::Message(ChannelMessage::Binary(_))) => {
                        trace!(target = "peerlink::session", session = %self.id, "binary control frame dropped");
                    }
                    Some(ChannelEvent::Close) | None => break LinkEnd::Lost("control channel closed".into()),
                },
                _ = heartbeat.tick() => {
                    if self.control().is_some() {
                        let _ = self.send(&Message::HeartbeatPing { time: unix_millis() }).await;
                    }
                }
                _ = sleep_until_optional(grace) => {
                    break LinkEnd::Lost("transport disconnected past grace".into());
                }
            }
        };

        match &end {
            LinkEnd::Dropped => info!(target = "peerlink::session", session = %self.id, "session dropped"),
            LinkEnd::Lost(reason) => {
                warn!(target = "peerlink::session", session = %self.id, %reason, "session link lost");
            }
        }
        self.teardown().await;
        self.running.store(false, Ordering::SeqCst);
        if end == LinkEnd::Dropped {
            self.set_state(SessionState::Closed);
        }
        end
    }

    /// Local drop. Idempotent.
    pub async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closing);
        self.closing.send_replace(true);
        if !self.running.load(Ordering::SeqCst) {
            self.finish().await;
        }
    }

    /// Releases everything and marks the session closed.
    pub async fn finish(&self) {
        self.teardown().await;
        self.set_state(SessionState::Closed);
    }

    /// Between a lost link and the next promoted attempt.
    pub(crate) fn mark_reconnecting(&self) {
        self.set_state(SessionState::Connecting);
    }

    async fn teardown(&self) {
        let link = self.link.lock().take();
        self.tunnels.close_all().await;
        self.proxies.close_all();
        for task in self.serving.lock().drain(..) {
            task.abort();
        }
        if let Some(link) = link {
            if let Some(control) = link.control {
                control.close().await;
            }
            link.connection.close().await;
        }
    }

    fn control(&self) -> Option<Arc<dyn RtcDataChannel>> {
        self.link
            .lock()
            .as_ref()
            .and_then(|link| link.control.clone())
            .filter(|control| control.is_open())
    }

    /// Sends a control message. Fails unless the control channel is open.
    pub async fn send(&self, message: &Message) -> Result<(), PeerError> {
        let control = self.control().ok_or(TransportError::ChannelClosed)?;
        let text = message.encode()?;
        send_text(control.as_ref(), text).await?;
        Ok(())
    }

    fn track(&self, task: AbortHandle) {
        let mut serving = self.serving.lock();
        serving.retain(|running| !running.is_finished());
        serving.push(task);
    }

    fn on_channel(
        self: &Arc<Self>,
        channel: Arc<dyn RtcDataChannel>,
        control_events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    ) {
        let protocol = channel.protocol();
        match protocol.as_str() {
            CONTROL_PROTOCOL if control_events.is_none() => {
                debug!(target = "peerlink::session", session = %self.id, "control channel announced");
                *control_events = channel.take_events();
                if let Some(link) = self.link.lock().as_mut() {
                    link.control = Some(channel);
                }
            }
            TUNNEL_PROTOCOL => {
                let target = self.context.config.lan_target_host;
                let chunk = self.context.config.chunk_bytes;
                let tunnels = Arc::clone(&self.tunnels);
                let task = tokio::spawn(tunnel::connect_remote(channel, target, tunnels, chunk));
                self.track(task.abort_handle());
            }
            DOWNLOAD_PROTOCOL => {
                debug!(target = "peerlink::session", session = %self.id, path = %channel.label(), "file requested");
                let context = Arc::clone(&self.context);
                let task = tokio::spawn(async move {
                    transfer::serve(channel, &context.sharing, &context.config).await;
                });
                self.track(task.abort_handle());
            }
            PING_PROTOCOL => {}
            _ => {
                debug!(target = "peerlink::session", session = %self.id, %protocol, "unknown channel protocol");
                let task = tokio::spawn(async move { channel.close().await });
                self.track(task.abort_handle());
            }
        }
    }

    async fn on_control_open(self: &Arc<Self>) {
        self.set_state(SessionState::Connected);
        let profile = self.context.identity.profile();
        if let Err(err) = self.send(&Message::Identity(profile)).await {
            warn!(target = "peerlink::session", session = %self.id, error = %err, "identity not sent");
        }
        let servers = self.context.lan_servers.read().clone();
        if !servers.is_empty() {
            let _ = self.send(&Message::Lan { servers }).await;
        }
        if let Some(manifest) = self.context.sharing.manifest() {
            let _ = self.send(&Message::ShareManifest(manifest)).await;
        }
    }

    async fn on_control_text(self: &Arc<Self>, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(target = "peerlink::session", session = %self.id, %kind, "unknown control message ignored");
                return;
            }
            Err(err) => {
                warn!(target = "peerlink::session", session = %self.id, error = %err, "control frame dropped");
                return;
            }
        };
        trace!(target = "peerlink::session", session = %self.id, kind = message.kind(), "control message");
        self.dispatch(message).await;
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Identity(profile) => {
                *self.remote_profile.write() = Some(profile.clone());
                self.context.emit(PeerEvent::Identity {
                    session: Some(self.id.clone()),
                    peer: self.remote(),
                    profile,
                });
            }
            Message::HeartbeatPing { time } => {
                let _ = self.send(&Message::HeartbeatPong { time }).await;
            }
            Message::HeartbeatPong { time } => {
                let latency = Duration::from_millis(unix_millis().saturating_sub(time));
                *self.latency.write() = Some(latency);
                self.context.emit(PeerEvent::Latency {
                    session: self.id.clone(),
                    latency,
                });
            }
            Message::Lan { servers } => {
                for server in servers {
                    if let Err(err) = self.expose_remote_lan(server.clone()).await {
                        warn!(
                            target = "peerlink::session",
                            session = %self.id,
                            port = server.port,
                            error = %err,
                            "LAN proxy failed"
                        );
                    }
                }
            }
            Message::ShareManifest(manifest) => {
                *self.remote_manifest.write() = Some(manifest.clone());
                self.context.emit(PeerEvent::ManifestShared {
                    session: self.id.clone(),
                    manifest,
                });
            }
            Message::GetSharedManifest => {
                if let Some(manifest) = self.context.sharing.manifest() {
                    let _ = self.send(&Message::ShareManifest(manifest)).await;
                }
            }
        }
    }

    /// Creates or reuses the local listener for a remote LAN server and
    /// returns its local port.
    pub async fn expose_remote_lan(self: &Arc<Self>, server: LanServer) -> io::Result<u16> {
        let opener: Weak<dyn ChannelOpener> = Arc::downgrade(self) as Weak<dyn ChannelOpener>;
        let host = self.context.config.proxy_bind_host;
        let chunk = self.context.config.chunk_bytes;
        let tunnels = Arc::clone(&self.tunnels);
        let local_port = self
            .proxies
            .get_or_bind(server.port, || {
                ServerProxy::bind(host, server.port, opener, tunnels, chunk)
            })
            .await?;
        self.context.emit(PeerEvent::LanDiscovered {
            session: self.id.clone(),
            remote_port: server.port,
            local_port,
            motd: server.motd,
        });
        Ok(local_port)
    }

    /// Streams a remote virtual path into `writer`. Bounded by the shared
    /// download limit.
    pub async fn download<W>(&self, path: &str, writer: &mut W) -> Result<u64, PeerError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let _permit = self
            .context
            .downloads
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;
        transfer::download(self, path, writer).await
    }
}

#[async_trait]
impl ChannelOpener for PeerSession {
    async fn open_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        let connection = self
            .link
            .lock()
            .as_ref()
            .map(|link| Arc::clone(&link.connection))
            .ok_or(TransportError::Closed)?;
        connection.create_data_channel(label, init).await
    }
}

async fn recv_optional<T>(receiver: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::error::FileDenial;
    use crate::rtc::RtcFactory;
    use crate::rtc::loopback::LoopbackNetwork;
    use messages::SharedFile;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Linked {
        host: Arc<PeerSession>,
        guest: Arc<PeerSession>,
        host_run: JoinHandle<LinkEnd>,
        guest_run: JoinHandle<LinkEnd>,
        guest_connection: Arc<dyn RtcConnection>,
        events: broadcast::Receiver<PeerEvent>,
    }

    fn context(name: &str, events: &broadcast::Sender<PeerEvent>) -> Arc<SessionContext> {
        let config = PeerConfig {
            proxy_bind_host: LOCALHOST,
            lan_target_host: LOCALHOST,
            ..PeerConfig::default()
        };
        let identity = Arc::new(LocalIdentity::generate(PeerProfile {
            name: name.into(),
            ..PeerProfile::default()
        }));
        Arc::new(SessionContext::new(config, identity, events.clone()))
    }

    fn winner(connection: Arc<dyn RtcConnection>) -> Winner {
        let events = connection.take_events().expect("events");
        Winner {
            attempt: 0,
            connection,
            events,
            ping: None,
            pending_channels: Vec::new(),
            latency: None,
            servers: Vec::new(),
        }
    }

    /// `host` initiates and creates the control channel; `guest` answers.
    async fn linked(host_ctx: Arc<SessionContext>, guest_ctx: Arc<SessionContext>) -> Linked {
        let events = host_ctx.events.subscribe();
        let net = LoopbackNetwork::new();
        let a = net.create_connection(&[], None).await.expect("a");
        let b = net.create_connection(&[], None).await.expect("b");
        let offer = a.create_offer().await.expect("offer");
        b.set_remote_description(offer).await.expect("offer applied");
        let answer = b.create_answer().await.expect("answer");
        a.set_remote_description(answer).await.expect("answer applied");

        let host = PeerSession::new("s-1", Role::Initiator, Some(guest_ctx.identity.id()), host_ctx);
        let guest = PeerSession::new("s-1", Role::Responder, None, guest_ctx);
        let host_run = tokio::spawn({
            let host = Arc::clone(&host);
            let winner = winner(a);
            async move { host.run(winner).await }
        });
        let guest_run = tokio::spawn({
            let guest = Arc::clone(&guest);
            let winner = winner(Arc::clone(&b));
            async move { guest.run(winner).await }
        });
        Linked {
            host,
            guest,
            host_run,
            guest_run,
            guest_connection: b,
            events,
        }
    }

    async fn until_connected(session: &PeerSession) {
        let mut state = session.watch_state();
        state
            .wait_for(|state| *state == SessionState::Connected)
            .await
            .expect("state");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn control_open_exchanges_identity_and_heartbeats() {
        let (events, _) = broadcast::channel(64);
        let mut link = linked(context("host", &events), context("guest", &events)).await;
        until_connected(&link.host).await;
        until_connected(&link.guest).await;

        let mut latency_seen = false;
        while !latency_seen {
            if let PeerEvent::Latency { session, .. } = link.events.recv().await.expect("event") {
                assert_eq!(session, "s-1");
                latency_seen = true;
            }
        }
        assert_eq!(link.guest.remote_profile().map(|profile| profile.name), Some("host".into()));
        assert_eq!(link.host.remote_profile().map(|profile| profile.name), Some("guest".into()));
        assert!(link.host.latency().is_some());

        link.host.close().await;
        assert_eq!(link.host_run.await.expect("host"), LinkEnd::Dropped);
        assert_eq!(link.host.state(), SessionState::Closed);
        assert!(matches!(link.guest_run.await.expect("guest"), LinkEnd::Lost(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn file_requests_outside_manifest_are_refused() {
        let (events, _) = broadcast::channel(64);
        let host_ctx = context("host", &events);
        let root = std::env::temp_dir().join(format!("peerlink-share-{}", PeerId::random()));
        tokio::fs::create_dir_all(root.join("mods")).await.expect("dir");
        tokio::fs::write(root.join("mods/a.jar"), vec![7u8; 40_000]).await.expect("file");
        host_ctx.sharing.share(
            SharedManifest {
                files: ["mods/a.jar", "mods/missing.jar"]
                    .iter()
                    .map(|path| SharedFile {
                        path: path.to_string(),
                        ..SharedFile::default()
                    })
                    .collect(),
                ..SharedManifest::default()
            },
            root.clone(),
        );
        let link = linked(host_ctx, context("guest", &events)).await;
        until_connected(&link.guest).await;

        for path in ["/sharing/mods/b.jar", "/sharing/../mods/a.jar"] {
            let mut sink = Vec::new();
            let result = link.guest.download(path, &mut sink).await;
            assert!(matches!(result, Err(PeerError::Denied(FileDenial::NoPermission))));
            assert!(sink.is_empty());
        }
        let mut sink = Vec::new();
        let missing = link.guest.download("/sharing/mods/missing.jar", &mut sink).await;
        assert!(matches!(missing, Err(PeerError::Denied(FileDenial::NotFound))));

        let mut sink = Vec::new();
        let bytes = link
            .guest
            .download("/sharing/mods/a.jar", &mut sink)
            .await
            .expect("download");
        assert_eq!(bytes, 40_000);
        assert_eq!(sink, vec![7u8; 40_000]);

        let mut manifest = Vec::new();
        link.guest.download("/sharing", &mut manifest).await.expect("manifest");
        let parsed: SharedManifest = serde_json::from_slice(&manifest).expect("json");
        assert_eq!(parsed.files.len(), 2);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_lan_discoveries_share_one_proxy() {
        let (events, _) = broadcast::channel(64);
        let link = linked(context("host", &events), context("guest", &events)).await;
        until_connected(&link.guest).await;
        let server = LanServer {
            port: 25565,
            motd: "survival".into(),
        };
        let (first, second) = tokio::join!(
            link.guest.expose_remote_lan(server.clone()),
            link.guest.expose_remote_lan(server)
        );
        let first = first.expect("first");
        assert_eq!(first, second.expect("second"));
        assert_eq!(link.guest.proxy_ports(), vec![(25565, first)]);
    }

    async fn echo_server() -> u16 {
        let lan = TcpListener::bind((LOCALHOST, 0)).await.expect("lan");
        let lan_port = lan.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = lan.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        lan_port
    }

    /// Opens three echoing tunnels from the host to the guest's LAN server.
    async fn tunnels(link: &Linked) -> Vec<TcpStream> {
        let lan_port = echo_server().await;
        until_connected(&link.host).await;
        let local_port = link
            .host
            .expose_remote_lan(LanServer {
                port: lan_port,
                motd: String::new(),
            })
            .await
            .expect("proxy");

        let mut clients = Vec::new();
        for n in 0..3u8 {
            let mut client = TcpStream::connect((LOCALHOST, local_port)).await.expect("client");
            client.write_all(&[n; 4]).await.expect("write");
            let mut echo = [0u8; 4];
            client.read_exact(&mut echo).await.expect("echo");
            assert_eq!(echo, [n; 4]);
            clients.push(client);
        }
        assert_eq!(link.host.tunnel_count(), 3);
        clients
    }

    async fn assert_torn_down(link: Linked, clients: Vec<TcpStream>) {
        assert!(matches!(link.host_run.await.expect("host"), LinkEnd::Lost(_)));
        assert_eq!(link.host.tunnel_count(), 0);
        assert!(link.host.proxy_ports().is_empty());
        for mut client in clients {
            let mut rest = Vec::new();
            let read = client.read_to_end(&mut rest).await;
            assert!(read.map(|n| n == 0).unwrap_or(true));
        }
        link.guest.close().await;
        let _ = link.guest_run.await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn lost_transport_destroys_every_tunnel() {
        let (events, _) = broadcast::channel(64);
        let link = linked(context("host", &events), context("guest", &events)).await;
        let clients = tunnels(&link).await;

        link.guest_connection.close().await;
        assert_torn_down(link, clients).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_control_channel_alone_destroys_every_tunnel() {
        let (events, _) = broadcast::channel(64);
        let link = linked(context("host", &events), context("guest", &events)).await;
        let clients = tunnels(&link).await;
        until_connected(&link.guest).await;

        let control = link.guest.control().expect("guest control channel");
        control.close().await;
        assert_torn_down(link, clients).await;
        assert!(!control.is_open());
    }
}
