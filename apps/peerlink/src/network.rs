//! The consumer-facing engine: owns the ICE pool, NAT classifier, group
//! membership and the session registry, and wires races to signaling.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::events::PeerEvent;
use crate::group::{GroupCoordinator, GroupSignal, generate_group_id};
use crate::ice::{IceServerPool, partition, relay_partitions};
use crate::identity::{LocalIdentity, PeerId, PeerProfile};
use crate::nat::{MappingPool, NatClassifier, NatVerdict, PortMapper};
use crate::racer::{
    CandidateRacer, LocalDescriptor, RaceConfig, RaceInput, RaceOutcome, RacerHandle, Role,
};
use crate::rtc::{IceCandidate, IceServer, RtcFactory, SdpKind, SessionDescription};
use crate::session::messages::{LanServer, Message, SharedManifest};
use crate::session::registry::SessionRegistry;
use crate::session::{LinkEnd, PeerSession, SessionContext, SessionState};
use crate::signaling::{Delivery, Descriptor, SignalingRelay, deliver_with_retry};

const EVENT_CAPACITY: usize = 256;
const ICE_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, Default)]
pub struct InitiateOptions {
    /// The peer to signal through the group relay. Without it the local
    /// description is published for manual exchange.
    pub remote: Option<PeerId>,
    pub session: Option<String>,
    /// Tried ahead of the pool's servers.
    pub ice_servers: Vec<IceServer>,
}

/// One attempt's offer or answer inside a [`TransferDescription`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescription {
    #[serde(default)]
    pub attempt: u32,
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
}

impl From<LocalDescriptor> for ConnectionDescription {
    fn from(local: LocalDescriptor) -> Self {
        Self {
            attempt: local.attempt,
            sdp: local.description.sdp,
            kind: local.description.kind,
            candidates: local.candidates,
            ice_servers: local.ice_servers,
        }
    }
}

/// Copy/paste signaling payload, carried as base64 JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescription {
    pub id: PeerId,
    pub session: String,
    pub connections: Vec<ConnectionDescription>,
}

impl TransferDescription {
    pub fn encode(&self) -> Result<String, PeerError> {
        let json = serde_json::to_vec(self)
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(text: &str) -> Result<Self, PeerError> {
        let json = STANDARD
            .decode(text.trim())
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        serde_json::from_slice(&json).map_err(|err| PeerError::InvalidDescription(err.to_string()))
    }
}

struct Membership {
    coordinator: GroupCoordinator,
    pump: JoinHandle<()>,
}

struct Inner {
    config: PeerConfig,
    rtc: Arc<dyn RtcFactory>,
    identity: Arc<LocalIdentity>,
    events: broadcast::Sender<PeerEvent>,
    context: Arc<SessionContext>,
    ice: IceServerPool,
    nat: NatClassifier,
    mappings: Option<MappingPool>,
    sessions: SessionRegistry,
    races: Mutex<HashMap<String, mpsc::UnboundedSender<RaceInput>>>,
    /// Lowest attempt index a new responder race may start from, per session.
    attempt_floor: Mutex<HashMap<String, u32>>,
    manual: Mutex<HashSet<String>>,
    deliveries: Mutex<HashMap<(String, u32), AbortHandle>>,
    relay: RwLock<Option<Arc<SignalingRelay>>>,
    membership: Mutex<Option<Membership>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PeerNetwork {
    inner: Arc<Inner>,
}

impl PeerNetwork {
    pub fn new(
        config: PeerConfig,
        rtc: Arc<dyn RtcFactory>,
        mapper: Option<Arc<dyn PortMapper>>,
    ) -> Self {
        Self::with_identity(config, rtc, mapper, LocalIdentity::generate(PeerProfile::default()))
    }

    pub fn with_identity(
        config: PeerConfig,
        rtc: Arc<dyn RtcFactory>,
        mapper: Option<Arc<dyn PortMapper>>,
        identity: LocalIdentity,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let identity = Arc::new(identity);
        let context = Arc::new(SessionContext::new(
            config.clone(),
            Arc::clone(&identity),
            events.clone(),
        ));
        let inner = Inner {
            ice: IceServerPool::new(config.clone(), Arc::clone(&rtc), events.clone()),
            nat: NatClassifier::new(config.clone(), events.clone()),
            mappings: mapper.map(MappingPool::new),
            config,
            rtc,
            identity,
            events,
            context,
            sessions: SessionRegistry::default(),
            races: Mutex::new(HashMap::new()),
            attempt_floor: Mutex::new(HashMap::new()),
            manual: Mutex::new(HashSet::new()),
            deliveries: Mutex::new(HashMap::new()),
            relay: RwLock::new(None),
            membership: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.identity.id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn ice(&self) -> &IceServerPool {
        &self.inner.ice
    }

    /// Tests cached and bootstrap ICE servers, merges the discovery list,
    /// then keeps both fresh in the background and classifies the NAT.
    pub async fn start(&self) {
        self.inner.ice.init().await;
        if let Err(err) = self.inner.ice.update().await {
            warn!(target = "peerlink::ice", error = %err, "ice discovery failed");
        }
        let inner = Arc::clone(&self.inner);
        let refresher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ICE_REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = inner.ice.update().await {
                    warn!(target = "peerlink::ice", error = %err, "ice refresh failed");
                }
            }
        });
        let network = self.clone();
        let nat = tokio::spawn(async move {
            network.refresh_nat().await;
        });
        self.inner.background.lock().extend([refresher, nat]);
    }

    pub async fn update_ice_servers(&self) -> Result<(), PeerError> {
        self.inner.ice.update().await
    }

    /// Classifies the local NAT against the pool's STUN servers. Advisory.
    pub async fn refresh_nat(&self) -> NatVerdict {
        let (stuns, _) = self.inner.ice.get(&[]);
        let servers: Vec<String> = stuns.iter().filter_map(IceServer::host_port).collect();
        let observed = self.inner.ice.observed_public_ips();
        self.inner.nat.classify(&servers, &observed).await
    }

    pub fn session(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.inner.sessions.get(id)
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.inner.sessions.all()
    }

    /// Starts a race as the initiator and returns the session id at once.
    /// Repeating an id that is still registered is a no-op.
    pub fn initiate(&self, options: InitiateOptions) -> Result<String, PeerError> {
        self.inner.initiate(options)
    }

    /// Applies a copy/paste description. Offers start (or feed) a responder
    /// race; answers feed the matching initiator race.
    pub fn set_remote_description(&self, description: &str) -> Result<String, PeerError> {
        let transfer = TransferDescription::decode(description)?;
        let session = transfer.session.clone();
        if transfer
            .connections
            .iter()
            .any(|connection| connection.kind == SdpKind::Offer)
        {
            self.inner.manual.lock().insert(session.clone());
        }
        for connection in transfer.connections {
            let accepted = self.inner.accept_remote(
                &session,
                transfer.id,
                connection.attempt,
                SessionDescription {
                    sdp: connection.sdp,
                    kind: connection.kind,
                },
                connection.candidates,
                (!connection.ice_servers.is_empty()).then_some(connection.ice_servers),
            );
            if !accepted && connection.kind == SdpKind::Answer {
                return Err(PeerError::UnknownSession(session));
            }
        }
        Ok(session)
    }

    /// Local drop: cancels a pending race or closes the live link.
    pub async fn drop_session(&self, id: &str) -> Result<(), PeerError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .ok_or_else(|| PeerError::UnknownSession(id.to_string()))?;
        if let Some(inputs) = self.inner.races.lock().remove(id) {
            let _ = inputs.send(RaceInput::Cancel);
        }
        session.close().await;
        self.inner.sessions.remove_exact(&session);
        self.inner.attempt_floor.lock().remove(id);
        self.inner.manual.lock().remove(id);
        Ok(())
    }

    /// Offers an instance to every current and future session.
    pub async fn share_instance(&self, manifest: SharedManifest, root: impl Into<PathBuf>) {
        self.inner.context.sharing.share(manifest.clone(), root);
        self.inner.broadcast(Message::ShareManifest(manifest)).await;
    }

    pub fn unshare_instance(&self) {
        self.inner.context.sharing.unshare();
    }

    pub async fn set_user_info(&self, profile: PeerProfile) {
        self.inner.identity.set_profile(profile.clone());
        if let Some(relay) = self.inner.relay() {
            if let Err(err) = relay.send_me(profile.clone()) {
                debug!(target = "peerlink::group", error = %err, "profile not sent to relay");
            }
        }
        self.inner.broadcast(Message::Identity(profile)).await;
    }

    /// Publishes the local LAN servers to every current and future session.
    pub async fn advertise_lan(&self, servers: Vec<LanServer>) {
        *self.inner.context.lan_servers.write() = servers.clone();
        self.inner.broadcast(Message::Lan { servers }).await;
    }

    pub async fn download<W>(&self, session: &str, path: &str, writer: &mut W) -> Result<u64, PeerError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let session = self
            .inner
            .sessions
            .get(session)
            .ok_or_else(|| PeerError::UnknownSession(session.to_string()))?;
        session.download(path, writer).await
    }

    /// Joins `group`, or a generated `<name>@<n>` group. Leaves the current
    /// group first.
    pub async fn join_group(&self, group: Option<String>) -> Result<String, PeerError> {
        let _ = self.leave_group().await;
        let group = group.unwrap_or_else(|| generate_group_id(&self.inner.identity.profile().name));
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let coordinator = GroupCoordinator::join(
            &self.inner.config,
            Arc::clone(&self.inner.identity),
            &group,
            signals_tx,
        )?;
        *self.inner.relay.write() = Some(Arc::clone(coordinator.relay()));
        let pump = tokio::spawn(Arc::clone(&self.inner).pump_group(group.clone(), signals_rx));
        *self.inner.membership.lock() = Some(Membership { coordinator, pump });
        self.inner.emit(PeerEvent::GroupJoined {
            group: group.clone(),
        });
        Ok(group)
    }

    /// Leaves the group. Established sessions stay up.
    pub async fn leave_group(&self) -> Result<(), PeerError> {
        let membership = self.inner.membership.lock().take().ok_or(PeerError::NotInGroup)?;
        self.inner.relay.write().take();
        membership.pump.abort();
        let group = membership.coordinator.group().to_string();
        membership.coordinator.leave().await;
        self.inner.emit(PeerEvent::GroupLeft { group });
        Ok(())
    }

    pub fn group(&self) -> Option<String> {
        self.inner
            .membership
            .lock()
            .as_ref()
            .map(|membership| membership.coordinator.group().to_string())
    }

    /// Leaves the group, drops every session and releases port mappings.
    pub async fn shutdown(&self) {
        let _ = self.leave_group().await;
        for session in self.inner.sessions.all() {
            let _ = self.drop_session(session.id()).await;
        }
        if let Some(mappings) = &self.inner.mappings {
            mappings.unmap_all().await;
        }
        for task in self.inner.background.lock().drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn relay(&self) -> Option<Arc<SignalingRelay>> {
        self.relay.read().clone()
    }

    fn partitions(&self, preferred: &[IceServer]) -> (Vec<Vec<IceServer>>, Vec<IceServer>) {
        let (pool_stuns, pool_turns) = self.ice.get(preferred);
        let mut stuns: Vec<IceServer> = Vec::new();
        let mut turns: Vec<IceServer> = Vec::new();
        for server in preferred.iter().chain(pool_stuns.iter()).chain(pool_turns.iter()) {
            let bucket = if server.is_turn() { &mut turns } else { &mut stuns };
            if !bucket.iter().any(|known| known.url == server.url) {
                bucket.push(server.clone());
            }
        }
        if !self.config.allow_turn {
            turns.clear();
        }
        (
            partition(&stuns, &turns, self.config.max_turn_partitions),
            turns,
        )
    }

    async fn broadcast(&self, message: Message) {
        for session in self.sessions.all() {
            if session.state() != SessionState::Connected {
                continue;
            }
            if let Err(err) = session.send(&message).await {
                debug!(
                    target = "peerlink::session",
                    session = %session.id(),
                    kind = message.kind(),
                    error = %err,
                    "broadcast skipped"
                );
            }
        }
    }

    fn initiate(self: &Arc<Self>, options: InitiateOptions) -> Result<String, PeerError> {
        let id = options
            .session
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = PeerSession::new(
            id.clone(),
            Role::Initiator,
            options.remote,
            Arc::clone(&self.context),
        );
        if !Arc::ptr_eq(&self.sessions.insert(Arc::clone(&session)), &session) {
            return Ok(id);
        }
        match (options.remote, self.relay()) {
            (Some(remote), Some(relay)) => {
                if let Err(err) = relay.send_who(remote) {
                    debug!(target = "peerlink::group", error = %err, "WHO not sent");
                }
                let _ = relay.send_me(self.identity.profile());
            }
            _ => {
                self.manual.lock().insert(id.clone());
            }
        }
        info!(target = "peerlink::racer", session = %id, remote = ?options.remote, "initiating");
        tokio::spawn(Arc::clone(self).supervise_initiator(session, options.ice_servers));
        Ok(id)
    }

    fn begin_race(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        role: Role,
        partitions: Vec<Vec<IceServer>>,
        first_attempt: u32,
    ) -> RacerHandle {
        let (outputs, outputs_rx) = mpsc::unbounded_channel();
        let handle = CandidateRacer::start(
            session.id(),
            Arc::clone(&self.rtc),
            role,
            partitions,
            first_attempt,
            RaceConfig::from_config(&self.config),
            outputs,
        );
        self.races
            .lock()
            .insert(session.id().to_string(), handle.inputs());
        tokio::spawn(Arc::clone(self).forward_local(Arc::clone(session), outputs_rx));
        handle
    }

    async fn end_race(&self, session: &PeerSession, handle: RacerHandle) -> RaceOutcome {
        let inputs = handle.inputs();
        let outcome = handle.outcome().await;
        let mut races = self.races.lock();
        if races
            .get(session.id())
            .is_some_and(|current| current.same_channel(&inputs))
        {
            races.remove(session.id());
        }
        outcome
    }

    async fn supervise_initiator(self: Arc<Self>, session: Arc<PeerSession>, preferred: Vec<IceServer>) {
        let mut next_attempt = 0u32;
        let mut reconnects = 0u32;
        loop {
            if session.is_closing() {
                break;
            }
            session.mark_reconnecting();
            let (partitions, turns) = self.partitions(&preferred);
            let count = partitions.len() as u32;
            let handle = self.begin_race(&session, Role::Initiator, partitions, next_attempt);
            next_attempt += count;
            let mut outcome = self.end_race(&session, handle).await;

            if matches!(outcome, RaceOutcome::NoWinner) && self.config.relay_fallback && !session.is_closing() {
                let relays = relay_partitions(&turns, self.config.max_turn_partitions);
                if !relays.is_empty() {
                    info!(target = "peerlink::racer", session = %session.id(), "retrying through relays only");
                    let count = relays.len() as u32;
                    let handle = self.begin_race(&session, Role::Initiator, relays, next_attempt);
                    next_attempt += count;
                    outcome = self.end_race(&session, handle).await;
                }
            }

            let winner = match outcome {
                RaceOutcome::Winner(winner) => winner,
                RaceOutcome::NoWinner => {
                    self.emit(PeerEvent::NoWinner {
                        session: session.id().to_string(),
                        remote: session.remote(),
                    });
                    break;
                }
                RaceOutcome::Cancelled => break,
            };
            match session.run(winner).await {
                LinkEnd::Dropped => break,
                LinkEnd::Lost(reason) => {
                    if session.is_closing() || reconnects >= self.config.reconnect_attempts {
                        break;
                    }
                    reconnects += 1;
                    info!(
                        target = "peerlink::session",
                        session = %session.id(),
                        %reason,
                        reconnects,
                        "reconnecting"
                    );
                }
            }
        }
        session.finish().await;
        self.sessions.remove_exact(&session);
    }

    async fn supervise_responder(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        handle: RacerHandle,
        live: Option<Arc<PeerSession>>,
    ) {
        let outcome = self.end_race(&session, handle).await;
        if let Some(live) = live {
            if !matches!(outcome, RaceOutcome::Winner(_)) {
                debug!(target = "peerlink::racer", session = %session.id(), "re-offer found no path, keeping link");
                return;
            }
            debug!(target = "peerlink::racer", session = %session.id(), "remote re-offered, replacing link");
            self.sessions.remove_exact(&live);
            live.close().await;
            self.sessions.insert(Arc::clone(&session));
        }
        match outcome {
            RaceOutcome::Winner(winner) => {
                if let LinkEnd::Lost(reason) = session.run(winner).await {
                    debug!(target = "peerlink::session", session = %session.id(), %reason, "responder link ended");
                }
            }
            RaceOutcome::NoWinner => self.emit(PeerEvent::NoWinner {
                session: session.id().to_string(),
                remote: session.remote(),
            }),
            RaceOutcome::Cancelled => {}
        }
        session.finish().await;
        self.sessions.remove_exact(&session);
    }

    /// Routes a remote description. Returns whether it was accepted.
    fn accept_remote(
        self: &Arc<Self>,
        session_id: &str,
        remote: PeerId,
        attempt: u32,
        description: SessionDescription,
        candidates: Vec<IceCandidate>,
        ice_servers: Option<Vec<IceServer>>,
    ) -> bool {
        let kind = description.kind;
        let mut input = RaceInput::Remote {
            attempt,
            description,
            candidates,
            ice_servers,
        };
        if let Some(inputs) = self.races.lock().get(session_id) {
            match inputs.send(input) {
                Ok(()) => {
                    self.raise_floor(session_id, attempt);
                    return true;
                }
                Err(mpsc::error::SendError(returned)) => input = returned,
            }
        }
        if kind != SdpKind::Offer {
            debug!(target = "peerlink::racer", session = %session_id, attempt, "answer for a finished race");
            return false;
        }
        let floor = self.attempt_floor.lock().get(session_id).copied().unwrap_or(0);
        if attempt < floor {
            trace!(target = "peerlink::racer", session = %session_id, attempt, floor, "stale offer");
            return false;
        }
        // A connected link is only replaced once the new offer wins its own
        // race; a late offer from a losing attempt never connects.
        let live = match self.sessions.get(session_id) {
            Some(existing) if existing.state() == SessionState::Connected => Some(existing),
            Some(stale) => {
                debug!(target = "peerlink::racer", session = %session_id, attempt, "remote re-offered, replacing link");
                self.sessions.remove_exact(&stale);
                tokio::spawn(async move { stale.close().await });
                None
            }
            None => None,
        };

        let session = PeerSession::new(
            session_id,
            Role::Responder,
            Some(remote),
            Arc::clone(&self.context),
        );
        if live.is_none() {
            self.sessions.insert(Arc::clone(&session));
            session.mark_reconnecting();
        }
        let (partitions, _) = self.partitions(&[]);
        let handle = self.begin_race(&session, Role::Responder, partitions, attempt);
        let _ = handle.inputs().send(input);
        self.raise_floor(session_id, attempt);
        info!(target = "peerlink::racer", session = %session_id, %remote, replacing = live.is_some(), "answering");
        tokio::spawn(Arc::clone(self).supervise_responder(session, handle, live));
        true
    }

    fn raise_floor(&self, session_id: &str, attempt: u32) {
        let mut floors = self.attempt_floor.lock();
        let floor = floors.entry(session_id.to_string()).or_default();
        *floor = (*floor).max(attempt + 1);
    }

    /// Sends each coalesced local descriptor through the relay, or publishes
    /// the accumulated transfer description for manual exchange.
    async fn forward_local(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        mut outputs: mpsc::UnboundedReceiver<LocalDescriptor>,
    ) {
        let mut published: BTreeMap<u32, ConnectionDescription> = BTreeMap::new();
        while let Some(local) = outputs.recv().await {
            self.map_reflexive(&local);
            let manual = self.manual.lock().contains(session.id());
            match (session.remote(), self.relay(), manual) {
                (Some(remote), Some(relay), false) => self.deliver(relay, &session, remote, local),
                _ => {
                    published.insert(local.attempt, local.into());
                    let transfer = TransferDescription {
                        id: self.identity.id(),
                        session: session.id().to_string(),
                        connections: published.values().cloned().collect(),
                    };
                    match transfer.encode() {
                        Ok(description) => self.emit(PeerEvent::LocalDescription {
                            session: session.id().to_string(),
                            description,
                        }),
                        Err(err) => warn!(target = "peerlink::racer", error = %err, "description not encoded"),
                    }
                }
            }
        }
    }

    /// One delivery task per `(session, attempt)`; a newer descriptor for
    /// the same attempt replaces the running one.
    fn deliver(self: &Arc<Self>, relay: Arc<SignalingRelay>, session: &PeerSession, remote: PeerId, local: LocalDescriptor) {
        let session_id = session.id().to_string();
        let attempt = local.attempt;
        let descriptor = Descriptor {
            receiver: remote,
            sender: self.identity.id(),
            sdp: local.description.sdp,
            sdp_type: local.description.kind,
            candidates: local.candidates,
            id: 0,
            session: Some(session_id.clone()),
            attempt,
            ice_servers: (!local.ice_servers.is_empty()).then_some(local.ice_servers),
        };
        let inner = Arc::clone(self);
        let key = (session_id.clone(), attempt);
        let task = tokio::spawn(async move {
            let result = deliver_with_retry(
                relay.as_ref(),
                descriptor,
                inner.config.descriptor_retry,
                inner.config.descriptor_cutoff,
                || inner.races.lock().contains_key(&session_id),
            )
            .await;
            match result {
                Ok(Delivery::Delivered { attempts }) => {
                    debug!(target = "peerlink::relay", session = %session_id, attempt, attempts, "descriptor delivered");
                }
                Ok(Delivery::Abandoned { .. }) => {}
                Err(err) => {
                    warn!(target = "peerlink::relay", session = %session_id, attempt, error = %err, "descriptor undelivered");
                    if let Some(inputs) = inner.races.lock().get(&session_id) {
                        let _ = inputs.send(RaceInput::Cancel);
                    }
                }
            }
            inner.deliveries.lock().remove(&(session_id, attempt));
        });
        let mut deliveries = self.deliveries.lock();
        deliveries.retain(|_, running| !running.is_finished());
        if let Some(previous) = deliveries.insert(key, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Best-effort gateway mapping for the hinted port once a reflexive
    /// candidate shows its public side.
    fn map_reflexive(self: &Arc<Self>, local: &LocalDescriptor) {
        let (Some(_), Some(private)) = (self.mappings.as_ref(), self.config.port_hint) else {
            return;
        };
        if local.attempt != 0 {
            return;
        }
        let Some(public) = local
            .candidates
            .iter()
            .filter(|candidate| candidate.is_server_reflexive())
            .find_map(IceCandidate::address)
            .map(|(_, port)| port)
        else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(mappings) = inner.mappings.as_ref() {
                if let Err(err) = mappings.map_port(private, public).await {
                    debug!(target = "peerlink::nat", private, public, error = %err, "port mapping skipped");
                }
            }
        });
    }

    async fn pump_group(self: Arc<Self>, group: String, mut signals: mpsc::UnboundedReceiver<GroupSignal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                GroupSignal::Heartbeat { peer, initiate } => {
                    if initiate && self.sessions.by_remote(&peer).is_none() {
                        let options = InitiateOptions {
                            remote: Some(peer),
                            ..InitiateOptions::default()
                        };
                        if let Err(err) = self.initiate(options) {
                            warn!(target = "peerlink::group", %peer, error = %err, "initiation failed");
                        }
                    }
                }
                GroupSignal::Descriptor(descriptor) => {
                    let session = descriptor
                        .session
                        .clone()
                        .unwrap_or_else(|| descriptor.sender.to_string());
                    self.accept_remote(
                        &session,
                        descriptor.sender,
                        descriptor.attempt,
                        SessionDescription {
                            sdp: descriptor.sdp,
                            kind: descriptor.sdp_type,
                        },
                        descriptor.candidates,
                        descriptor.ice_servers,
                    );
                }
                GroupSignal::Profile { peer, profile } => {
                    let session = self.sessions.by_remote(&peer).map(|session| session.id().to_string());
                    self.emit(PeerEvent::Identity {
                        session,
                        peer: Some(peer),
                        profile,
                    });
                }
                GroupSignal::State(state) => self.emit(PeerEvent::GroupState {
                    group: group.clone(),
                    state,
                }),
                GroupSignal::Ping(rtt) => self.emit(PeerEvent::RelayPing {
                    group: group.clone(),
                    rtt,
                }),
                GroupSignal::Error(error) => self.emit(PeerEvent::GroupError {
                    group: group.clone(),
                    error,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_description_is_base64_json() {
        let transfer = TransferDescription {
            id: PeerId::from_bytes([0xbb; 16]),
            session: "s-1".into(),
            connections: vec![ConnectionDescription {
                attempt: 1,
                sdp: "v=0".into(),
                kind: SdpKind::Offer,
                candidates: Vec::new(),
                ice_servers: vec![IceServer::stun("stun:stun.qq.com:3478")],
            }],
        };
        let encoded = transfer.encode().expect("encode");
        let json: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(&encoded).expect("base64")).expect("json");
        assert_eq!(json["connections"][0]["type"], "offer");
        assert_eq!(json["connections"][0]["iceServers"][0]["urls"], "stun:stun.qq.com:3478");
        assert_eq!(TransferDescription::decode(&encoded).expect("decode"), transfer);
    }

    #[test]
    fn garbage_descriptions_are_rejected() {
        assert!(matches!(
            TransferDescription::decode("%%%"),
            Err(PeerError::InvalidDescription(_))
        ));
        let not_json = STANDARD.encode("hello");
        assert!(matches!(
            TransferDescription::decode(&not_json),
            Err(PeerError::InvalidDescription(_))
        ));
    }
}
