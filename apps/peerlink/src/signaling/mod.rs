//! WebSocket relay client shared by every negotiation in a group.
//!
//! One supervisor task owns the socket. It reconnects with backoff, sends the
//! binary heartbeat, watches for an idle link and buffers outbound frames in
//! an unbounded queue that survives reconnects.

pub mod delivery;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError as WsProtocolError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::PeerConfig;
use crate::error::SignalingError;
use crate::identity::{PeerId, PeerProfile};

pub use delivery::{Delivery, RelayLink, deliver_with_retry};
pub use protocol::{Descriptor, Heartbeat, RelayFrame, unix_millis};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum RelayEvent {
    Heartbeat { peer: PeerId },
    Descriptor(Descriptor),
    Who { sender: Option<PeerId> },
    Profile { peer: PeerId, profile: PeerProfile },
    Ping(Duration),
    State(RelayState),
    Error(String),
}

struct Shared {
    local: PeerId,
    members: Mutex<HashMap<PeerId, Instant>>,
    echoes: Mutex<HashMap<u64, Arc<Notify>>>,
    events: mpsc::UnboundedSender<RelayEvent>,
    state: watch::Sender<RelayState>,
}

impl Shared {
    fn set_state(&self, next: RelayState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(target = "peerlink::relay", state = ?next, "relay state");
            let _ = self.events.send(RelayEvent::State(next));
        }
    }
}

pub struct SignalingRelay {
    group: String,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum LinkEnd {
    Lost,
    Shutdown,
}

impl SignalingRelay {
    /// Starts the supervisor for `group`. Returns as soon as the url is
    /// valid; the first connection is attempted in the background.
    pub fn connect(
        config: &PeerConfig,
        group: &str,
        local: PeerId,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Arc<Self>, SignalingError> {
        let url = config
            .group_url(group)
            .map_err(|err| SignalingError::InvalidUrl(err.to_string()))?;
        let (state_tx, _) = watch::channel(RelayState::Connecting);
        let shared = Arc::new(Shared {
            local,
            members: Mutex::new(HashMap::new()),
            echoes: Mutex::new(HashMap::new()),
            events,
            state: state_tx,
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = Arc::new(Self {
            group: group.to_string(),
            shared: Arc::clone(&shared),
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            next_id: AtomicU64::new(0),
            task: Mutex::new(None),
        });
        let supervisor = Supervisor {
            url,
            shared,
            heartbeat: config.relay_heartbeat,
            idle_timeout: config.relay_idle_timeout,
            backoff_min: config.reconnect_backoff_min,
            backoff_max: config.reconnect_backoff_max,
            outbound: outbound_rx,
            pending: None,
            shutdown: shutdown_rx,
        };
        *relay.task.lock() = Some(tokio::spawn(supervisor.run()));
        Ok(relay)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.local
    }

    pub fn state(&self) -> RelayState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.shared.state.subscribe()
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.shared.members.lock().keys().copied().collect()
    }

    pub fn send_who(&self, receiver: PeerId) -> Result<(), SignalingError> {
        self.send_frame(&RelayFrame::Who {
            receiver,
            sender: Some(self.shared.local),
        })
    }

    pub fn send_me(&self, profile: PeerProfile) -> Result<(), SignalingError> {
        self.send_frame(&RelayFrame::Me {
            sender: self.shared.local,
            profile,
        })
    }

    /// Stops the supervisor and closes the socket. Idempotent.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.shared.set_state(RelayState::Closing);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.set_state(RelayState::Closed);
        info!(target = "peerlink::relay", group = %self.group, "left relay group");
    }
}

impl RelayLink for SignalingRelay {
    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: &RelayFrame) -> Result<(), SignalingError> {
        let text = frame
            .encode()
            .map_err(|err| SignalingError::Encode(err.to_string()))?;
        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Closed)
    }

    fn register_echo(&self, id: u64) -> Arc<Notify> {
        Arc::clone(self.shared.echoes.lock().entry(id).or_default())
    }

    fn forget_echo(&self, id: u64) {
        self.shared.echoes.lock().remove(&id);
    }

    fn last_seen(&self, peer: &PeerId) -> Option<Instant> {
        self.shared.members.lock().get(peer).copied()
    }
}

impl Drop for SignalingRelay {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Supervisor {
    url: Url,
    shared: Arc<Shared>,
    heartbeat: Duration,
    idle_timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    outbound: mpsc::UnboundedReceiver<String>,
    /// A frame taken from the queue whose write failed; resent first.
    pending: Option<String>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = self.backoff_min;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.shared.set_state(RelayState::Connecting);
            let request = match self.request() {
                Ok(request) => request,
                Err(err) => {
                    warn!(target = "peerlink::relay", error = %err, "cannot build relay request");
                    let _ = self.shared.events.send(RelayEvent::Error(err.to_string()));
                    break;
                }
            };
            let connected = tokio::select! {
                result = connect_async(request) => result,
                _ = self.shutdown.changed() => break,
            };
            match connected {
                Ok((socket, _)) => {
                    info!(target = "peerlink::relay", url = %self.url, "relay connected");
                    backoff = self.backoff_min;
                    self.shared.set_state(RelayState::Connected);
                    match self.drive(socket).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost => {
                            debug!(target = "peerlink::relay", "relay link lost; reconnecting");
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        target = "peerlink::relay",
                        url = %self.url,
                        error = %err,
                        retry_in = ?backoff,
                        "relay connect failed"
                    );
                    let _ = self.shared.events.send(RelayEvent::Error(err.to_string()));
                }
            }
            self.shared.set_state(RelayState::Connecting);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    fn request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SignalingError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SignalingError::InvalidUrl(err.to_string()))?;
        let id = HeaderValue::from_str(&self.shared.local.to_string())
            .map_err(|err| SignalingError::InvalidUrl(err.to_string()))?;
        request.headers_mut().insert("id", id);
        Ok(request)
    }

    async fn drive(&mut self, socket: Socket) -> LinkEnd {
        let (mut write, mut read) = socket.split();
        let local = self.shared.local;

        if let Some(text) = self.pending.take() {
            if write.send(Message::Text(text.clone())).await.is_err() {
                self.pending = Some(text);
                return LinkEnd::Lost;
            }
        }

        let mut ticker = tokio::time::interval(self.heartbeat);
        let mut last_inbound = Instant::now();
        loop {
            let idle_deadline = last_inbound + self.idle_timeout;
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return LinkEnd::Shutdown;
                }
                Some(text) = self.outbound.recv() => {
                    trace!(target = "peerlink::relay", len = text.len(), "relay frame out");
                    if write.send(Message::Text(text.clone())).await.is_err() {
                        self.pending = Some(text);
                        return LinkEnd::Lost;
                    }
                }
                _ = ticker.tick() => {
                    let beat = Heartbeat::encode(&local, unix_millis());
                    if write.send(Message::Binary(beat)).await.is_err() {
                        return LinkEnd::Lost;
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    warn!(
                        target = "peerlink::relay",
                        idle = ?self.idle_timeout,
                        "relay link idle; reconnecting"
                    );
                    return LinkEnd::Lost;
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            last_inbound = Instant::now();
                            if let Some(echo) = self.handle_text(&text) {
                                if let Ok(reply) = echo.encode() {
                                    if write.send(Message::Text(reply)).await.is_err() {
                                        return LinkEnd::Lost;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            last_inbound = Instant::now();
                            self.handle_heartbeat(&data);
                        }
                        Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost,
                        Some(Ok(_)) => {
                            last_inbound = Instant::now();
                        }
                        Some(Err(err)) => {
                            match &err {
                                WsError::ConnectionClosed
                                | WsError::AlreadyClosed
                                | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                    debug!(target = "peerlink::relay", "relay websocket closed: {err}");
                                }
                                _ => {
                                    warn!(target = "peerlink::relay", "relay websocket error: {err}");
                                }
                            }
                            return LinkEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    fn handle_heartbeat(&self, data: &[u8]) {
        let Some(beat) = Heartbeat::decode(data) else {
            trace!(target = "peerlink::relay", len = data.len(), "ignoring binary frame");
            return;
        };
        if beat.peer == self.shared.local {
            return;
        }
        self.shared.members.lock().insert(beat.peer, Instant::now());
        let _ = self
            .shared
            .events
            .send(RelayEvent::Heartbeat { peer: beat.peer });
    }

    /// Dispatches one text frame. Returns the echo to write back for a
    /// descriptor addressed to this peer.
    fn handle_text(&self, text: &str) -> Option<RelayFrame> {
        let frame = match RelayFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target = "peerlink::relay", error = %err, "dropping relay frame");
                return None;
            }
        };
        let local = self.shared.local;
        if frame.receiver().is_some_and(|receiver| *receiver != local) {
            return None;
        }
        if frame.sender() == Some(&local) {
            return None;
        }
        if let Some(sender) = frame.sender() {
            self.shared.members.lock().insert(*sender, Instant::now());
        }
        match frame {
            RelayFrame::Descriptor(descriptor) => {
                let echo = RelayFrame::DescriptorEcho {
                    receiver: descriptor.sender,
                    sender: local,
                    id: descriptor.id,
                };
                debug!(
                    target = "peerlink::relay",
                    sender = %descriptor.sender,
                    id = descriptor.id,
                    attempt = descriptor.attempt,
                    "descriptor received"
                );
                let _ = self.shared.events.send(RelayEvent::Descriptor(descriptor));
                Some(echo)
            }
            RelayFrame::DescriptorEcho { id, .. } => {
                if let Some(notify) = self.shared.echoes.lock().get(&id) {
                    notify.notify_one();
                }
                None
            }
            RelayFrame::Who { sender, .. } => {
                let _ = self.shared.events.send(RelayEvent::Who { sender });
                None
            }
            RelayFrame::Me { sender, profile } => {
                let _ = self.shared.events.send(RelayEvent::Profile {
                    peer: sender,
                    profile,
                });
                None
            }
            RelayFrame::Pong { timestamp } => {
                let rtt = Duration::from_millis(unix_millis().saturating_sub(timestamp));
                let _ = self.shared.events.send(RelayEvent::Ping(rtt));
                None
            }
        }
    }
}
