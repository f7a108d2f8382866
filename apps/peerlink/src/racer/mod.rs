//! Candidate racing: several connection attempts for one peer pair, one per
//! ICE server partition, and the selection of a single winner.
//!
//! The initiator owns the decision. When its first attempt connects it arms
//! a settle timer; on expiry it keeps the open attempt with the lowest ping,
//! tells the other side with `selected` on that attempt's ping channel and
//! closes the rest. The responder only mirrors that choice.

pub mod coalesce;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::rtc::{
    ChannelEvent, ChannelInit, ChannelMessage, ConnectionState, IceCandidate, IceServer,
    RtcConnection, RtcDataChannel, RtcEvent, RtcFactory, SdpKind, SessionDescription, send_text,
};
use crate::session::CONTROL_PROTOCOL;

use coalesce::Coalescer;

pub const PING_PROTOCOL: &str = "ping";
const SELECTED: &str = "selected";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone, Debug)]
pub struct RaceConfig {
    pub settle: Duration,
    pub deadline: Duration,
    pub coalesce_idle: Duration,
    pub port_hint: Option<u16>,
}

impl RaceConfig {
    pub fn from_config(config: &PeerConfig) -> Self {
        Self {
            settle: config.settle_timeout,
            deadline: config.race_deadline,
            coalesce_idle: config.coalesce_idle,
            port_hint: config.port_hint,
        }
    }
}

#[derive(Debug)]
pub enum RaceInput {
    Remote {
        attempt: u32,
        description: SessionDescription,
        candidates: Vec<IceCandidate>,
        ice_servers: Option<Vec<IceServer>>,
    },
    Cancel,
}

/// A coalesced local descriptor for one attempt, ready for signaling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalDescriptor {
    pub attempt: u32,
    pub description: SessionDescription,
    pub candidates: Vec<IceCandidate>,
    pub ice_servers: Vec<IceServer>,
}

/// The promoted attempt. Its event stream and any data channels announced
/// before promotion are handed over intact.
pub struct Winner {
    pub attempt: u32,
    pub connection: Arc<dyn RtcConnection>,
    pub events: mpsc::UnboundedReceiver<RtcEvent>,
    pub ping: Option<Arc<dyn RtcDataChannel>>,
    pub pending_channels: Vec<Arc<dyn RtcDataChannel>>,
    pub latency: Option<Duration>,
    pub servers: Vec<IceServer>,
}

impl fmt::Debug for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Winner")
            .field("attempt", &self.attempt)
            .field("latency", &self.latency)
            .field("servers", &self.servers)
            .field("pending_channels", &self.pending_channels.len())
            .finish()
    }
}

#[derive(Debug)]
pub enum RaceOutcome {
    Winner(Winner),
    NoWinner,
    Cancelled,
}

pub struct RacerHandle {
    inputs: mpsc::UnboundedSender<RaceInput>,
    task: JoinHandle<RaceOutcome>,
}

impl RacerHandle {
    pub fn inputs(&self) -> mpsc::UnboundedSender<RaceInput> {
        self.inputs.clone()
    }

    pub fn cancel(&self) {
        let _ = self.inputs.send(RaceInput::Cancel);
    }

    pub async fn outcome(self) -> RaceOutcome {
        self.task.await.unwrap_or(RaceOutcome::Cancelled)
    }
}

struct Attempt {
    index: u32,
    servers: Vec<IceServer>,
    connection: Arc<dyn RtcConnection>,
    events: Option<mpsc::UnboundedReceiver<RtcEvent>>,
    ping: Option<Arc<dyn RtcDataChannel>>,
    ping_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    coalescer: Coalescer,
    state: ConnectionState,
    latency: Option<Duration>,
    remote_applied: bool,
    remote_candidates: HashSet<IceCandidate>,
    pending_channels: Vec<Arc<dyn RtcDataChannel>>,
    failed: bool,
}

impl Attempt {
    fn new(
        index: u32,
        servers: Vec<IceServer>,
        connection: Arc<dyn RtcConnection>,
        coalesce_idle: Duration,
    ) -> Self {
        let events = connection.take_events();
        Self {
            index,
            servers,
            connection,
            events,
            ping: None,
            ping_events: None,
            coalescer: Coalescer::new(coalesce_idle),
            state: ConnectionState::New,
            latency: None,
            remote_applied: false,
            remote_candidates: HashSet::new(),
            pending_channels: Vec::new(),
            failed: false,
        }
    }

    fn attach_ping(&mut self, channel: Arc<dyn RtcDataChannel>) {
        self.ping_events = channel.take_events();
        self.ping = Some(channel);
    }

    fn ping_open(&self) -> bool {
        self.ping.as_ref().is_some_and(|ping| ping.is_open())
    }
}

enum AttemptSignal {
    Rtc(RtcEvent),
    RtcEnded,
    Ping(ChannelEvent),
}

enum Step {
    Input(Option<RaceInput>),
    Attempt(usize, AttemptSignal),
    Flush,
    Settle,
    Deadline,
}

pub struct CandidateRacer {
    session: String,
    rtc: Arc<dyn RtcFactory>,
    role: Role,
    partitions: Vec<Vec<IceServer>>,
    first_attempt: u32,
    config: RaceConfig,
    outputs: mpsc::UnboundedSender<LocalDescriptor>,
    attempts: Vec<Attempt>,
    epoch: Instant,
    settle_at: Option<Instant>,
    awaiting_selection: bool,
}

impl CandidateRacer {
    /// Spawns the race. The initiator starts one attempt per partition right
    /// away; the responder creates attempts as their offers arrive, using
    /// the servers the offer names or `partitions[attempt % len]`.
    /// `first_attempt` numbers the attempts so a follow-up race never reuses
    /// an index of an earlier one.
    pub fn start(
        session: impl Into<String>,
        rtc: Arc<dyn RtcFactory>,
        role: Role,
        partitions: Vec<Vec<IceServer>>,
        first_attempt: u32,
        config: RaceConfig,
        outputs: mpsc::UnboundedSender<LocalDescriptor>,
    ) -> RacerHandle {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let racer = Self {
            session: session.into(),
            rtc,
            role,
            partitions,
            first_attempt,
            config,
            outputs,
            attempts: Vec::new(),
            epoch: Instant::now(),
            settle_at: None,
            awaiting_selection: false,
        };
        RacerHandle {
            inputs,
            task: tokio::spawn(racer.run(inputs_rx)),
        }
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<RaceInput>) -> RaceOutcome {
        if self.role == Role::Initiator {
            self.launch_all().await;
            if self.attempts.is_empty() {
                warn!(target = "peerlink::racer", session = %self.session, "no attempt could be started");
                return RaceOutcome::NoWinner;
            }
        }
        let deadline = Instant::now() + self.config.deadline;
        loop {
            let flush_at = self
                .attempts
                .iter()
                .filter_map(|attempt| attempt.coalescer.deadline())
                .min();
            let settle_at = self.settle_at;
            let step = tokio::select! {
                input = inputs.recv() => Step::Input(input),
                (index, signal) = next_signal(&mut self.attempts) => Step::Attempt(index, signal),
                _ = sleep_until_opt(flush_at) => Step::Flush,
                _ = sleep_until_opt(settle_at) => Step::Settle,
                _ = tokio::time::sleep_until(deadline) => Step::Deadline,
            };

            let finished = match step {
                Step::Input(None) | Step::Input(Some(RaceInput::Cancel)) => {
                    debug!(target = "peerlink::racer", session = %self.session, "race cancelled");
                    self.close_all().await;
                    return RaceOutcome::Cancelled;
                }
                Step::Input(Some(RaceInput::Remote {
                    attempt,
                    description,
                    candidates,
                    ice_servers,
                })) => {
                    self.apply_remote(attempt, description, candidates, ice_servers)
                        .await;
                    None
                }
                Step::Attempt(index, signal) => self.on_signal(index, signal).await,
                Step::Flush => {
                    let now = Instant::now();
                    for position in 0..self.attempts.len() {
                        if let Some(flush) = self.attempts[position].coalescer.poll_expired(now) {
                            self.emit(position, flush);
                        }
                    }
                    None
                }
                Step::Settle => {
                    self.settle_at = None;
                    match self.best() {
                        Some(position) => Some(position),
                        None => {
                            debug!(
                                target = "peerlink::racer",
                                session = %self.session,
                                "settle expired before any ping channel opened"
                            );
                            self.awaiting_selection = true;
                            None
                        }
                    }
                }
                Step::Deadline => {
                    warn!(target = "peerlink::racer", session = %self.session, "race deadline passed");
                    self.close_all().await;
                    return RaceOutcome::NoWinner;
                }
            };

            if let Some(position) = finished {
                return self.finish(position).await;
            }
            if self.role == Role::Initiator
                && self.attempts.iter().all(|attempt| attempt.failed)
            {
                info!(target = "peerlink::racer", session = %self.session, "every attempt failed");
                self.close_all().await;
                return RaceOutcome::NoWinner;
            }
        }
    }

    async fn launch_all(&mut self) {
        let partitions = self.partitions.clone();
        for (offset, servers) in partitions.into_iter().enumerate() {
            let index = self.first_attempt + offset as u32;
            let port_hint = if index == 0 { self.config.port_hint } else { None };
            let connection = match self.rtc.create_connection(&servers, port_hint).await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(
                        target = "peerlink::racer",
                        session = %self.session,
                        attempt = index,
                        error = %err,
                        "attempt setup failed"
                    );
                    continue;
                }
            };
            let mut attempt =
                Attempt::new(index, servers, connection, self.config.coalesce_idle);
            let offered = async {
                let ping = attempt
                    .connection
                    .create_data_channel(PING_PROTOCOL, ChannelInit::ordered(PING_PROTOCOL))
                    .await?;
                attempt.attach_ping(ping);
                attempt.connection.create_offer().await
            }
            .await;
            match offered {
                Ok(offer) => {
                    attempt.coalescer.set_description(offer);
                    debug!(
                        target = "peerlink::racer",
                        session = %self.session,
                        attempt = index,
                        servers = attempt.servers.len(),
                        "attempt started"
                    );
                    self.attempts.push(attempt);
                }
                Err(err) => {
                    warn!(
                        target = "peerlink::racer",
                        session = %self.session,
                        attempt = index,
                        error = %err,
                        "attempt offer failed"
                    );
                    attempt.connection.close().await;
                }
            }
        }
    }

    async fn apply_remote(
        &mut self,
        index: u32,
        description: SessionDescription,
        candidates: Vec<IceCandidate>,
        ice_servers: Option<Vec<IceServer>>,
    ) {
        let existing = self
            .attempts
            .iter()
            .position(|attempt| attempt.index == index);
        let position = match (existing, self.role, description.kind) {
            (Some(position), _, _) => position,
            (None, Role::Responder, SdpKind::Offer) => {
                let servers = ice_servers
                    .filter(|servers| !servers.is_empty())
                    .unwrap_or_else(|| self.fallback_servers(index));
                match self.rtc.create_connection(&servers, None).await {
                    Ok(connection) => {
                        self.attempts.push(Attempt::new(
                            index,
                            servers,
                            connection,
                            self.config.coalesce_idle,
                        ));
                        self.attempts.len() - 1
                    }
                    Err(err) => {
                        warn!(
                            target = "peerlink::racer",
                            session = %self.session,
                            attempt = index,
                            error = %err,
                            "attempt setup failed"
                        );
                        return;
                    }
                }
            }
            (None, _, kind) => {
                debug!(
                    target = "peerlink::racer",
                    session = %self.session,
                    attempt = index,
                    ?kind,
                    "descriptor for unknown attempt"
                );
                return;
            }
        };

        let role = self.role;
        let session = self.session.clone();
        let attempt = &mut self.attempts[position];
        if !attempt.remote_applied {
            let expected = match role {
                Role::Initiator => SdpKind::Answer,
                Role::Responder => SdpKind::Offer,
            };
            if description.kind != expected {
                warn!(
                    target = "peerlink::racer",
                    %session,
                    attempt = index,
                    kind = ?description.kind,
                    "unexpected description kind"
                );
                return;
            }
            if let Err(err) = attempt.connection.set_remote_description(description).await {
                warn!(target = "peerlink::racer", %session, attempt = index, error = %err, "remote description rejected");
                attempt.failed = true;
                return;
            }
            attempt.remote_applied = true;
            if role == Role::Responder {
                match attempt.connection.create_answer().await {
                    Ok(answer) => attempt.coalescer.set_description(answer),
                    Err(err) => {
                        warn!(target = "peerlink::racer", %session, attempt = index, error = %err, "answer failed");
                        attempt.failed = true;
                        return;
                    }
                }
            }
        }
        for candidate in candidates {
            if attempt.remote_candidates.insert(candidate.clone()) {
                if let Err(err) = attempt.connection.add_ice_candidate(candidate).await {
                    trace!(target = "peerlink::racer", %session, attempt = index, error = %err, "remote candidate rejected");
                }
            }
        }
    }

    fn fallback_servers(&self, index: u32) -> Vec<IceServer> {
        if self.partitions.is_empty() {
            return Vec::new();
        }
        self.partitions[index as usize % self.partitions.len()].clone()
    }

    /// Returns the position of the attempt that won, if this signal decided it.
    async fn on_signal(&mut self, position: usize, signal: AttemptSignal) -> Option<usize> {
        let index = self.attempts[position].index;
        match signal {
            AttemptSignal::Rtc(RtcEvent::LocalCandidate(candidate)) => {
                self.attempts[position].coalescer.push_candidate(candidate);
                None
            }
            AttemptSignal::Rtc(RtcEvent::GatheringComplete) => {
                if let Some(flush) = self.attempts[position].coalescer.complete() {
                    self.emit(position, flush);
                }
                None
            }
            AttemptSignal::Rtc(RtcEvent::StateChanged(state)) => {
                let attempt = &mut self.attempts[position];
                attempt.state = state;
                debug!(target = "peerlink::racer", session = %self.session, attempt = index, ?state, "attempt state");
                match state {
                    ConnectionState::Connected => {
                        attempt.failed = false;
                        if self.role == Role::Initiator && self.settle_at.is_none() {
                            self.settle_at = Some(Instant::now() + self.config.settle);
                        }
                    }
                    ConnectionState::Failed
                    | ConnectionState::Closed
                    | ConnectionState::Disconnected => attempt.failed = true,
                    ConnectionState::New | ConnectionState::Connecting => {}
                }
                None
            }
            AttemptSignal::Rtc(RtcEvent::DataChannel(channel)) => {
                let protocol = channel.protocol();
                let attempt = &mut self.attempts[position];
                if protocol == PING_PROTOCOL && attempt.ping.is_none() {
                    attempt.attach_ping(channel);
                    None
                } else if protocol == CONTROL_PROTOCOL && self.role == Role::Responder {
                    attempt.pending_channels.push(channel);
                    Some(position)
                } else {
                    attempt.pending_channels.push(channel);
                    None
                }
            }
            AttemptSignal::RtcEnded => {
                self.attempts[position].failed = true;
                None
            }
            AttemptSignal::Ping(event) => self.on_ping(position, event).await,
        }
    }

    async fn on_ping(&mut self, position: usize, event: ChannelEvent) -> Option<usize> {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let attempt = &mut self.attempts[position];
        let Some(ping) = attempt.ping.clone() else {
            return None;
        };
        match event {
            ChannelEvent::Open => {
                let _ = send_text(ping.as_ref(), format!("ping:{now_ms}")).await;
            }
            ChannelEvent::Message(ChannelMessage::Text(text)) => {
                if let Some(stamp) = text.strip_prefix("ping:") {
                    let _ = send_text(ping.as_ref(), format!("pong:{stamp}")).await;
                } else if let Some(stamp) = text.strip_prefix("pong:") {
                    if let Ok(sent) = stamp.parse::<u64>() {
                        let latency = Duration::from_millis(now_ms.saturating_sub(sent));
                        trace!(
                            target = "peerlink::racer",
                            session = %self.session,
                            attempt = attempt.index,
                            ?latency,
                            "attempt latency"
                        );
                        attempt.latency = Some(latency);
                    }
                } else if text == SELECTED && self.role == Role::Responder {
                    return Some(position);
                }
            }
            ChannelEvent::Message(ChannelMessage::Binary(_)) | ChannelEvent::Close => {}
        }
        if self.awaiting_selection {
            return self.best();
        }
        None
    }

    /// Lowest measured ping among connected attempts with an open ping
    /// channel; unmeasured attempts rank last, ties go to the lower index.
    fn best(&self) -> Option<usize> {
        self.attempts
            .iter()
            .enumerate()
            .filter(|(_, attempt)| attempt.state == ConnectionState::Connected && attempt.ping_open())
            .min_by_key(|(_, attempt)| (attempt.latency.unwrap_or(Duration::MAX), attempt.index))
            .map(|(position, _)| position)
    }

    fn emit(&self, position: usize, flush: coalesce::Flush) {
        let attempt = &self.attempts[position];
        debug!(
            target = "peerlink::racer",
            session = %self.session,
            attempt = attempt.index,
            candidates = flush.candidates.len(),
            "local descriptor ready"
        );
        let _ = self.outputs.send(LocalDescriptor {
            attempt: attempt.index,
            description: flush.description,
            candidates: flush.candidates,
            ice_servers: attempt.servers.clone(),
        });
    }

    async fn finish(mut self, position: usize) -> RaceOutcome {
        let winner = self.attempts.remove(position);
        if self.role == Role::Initiator {
            if let Some(ping) = winner.ping.as_ref() {
                if let Err(err) = send_text(ping.as_ref(), SELECTED).await {
                    warn!(target = "peerlink::racer", session = %self.session, error = %err, "failed to signal selection");
                }
            }
        }
        self.close_all().await;
        info!(
            target = "peerlink::racer",
            session = %self.session,
            attempt = winner.index,
            latency = ?winner.latency,
            role = ?self.role,
            "attempt selected"
        );
        RaceOutcome::Winner(Winner {
            attempt: winner.index,
            connection: winner.connection,
            events: winner.events.unwrap_or_else(|| mpsc::unbounded_channel().1),
            ping: winner.ping,
            pending_channels: winner.pending_channels,
            latency: winner.latency,
            servers: winner.servers,
        })
    }

    async fn close_all(&mut self) {
        for attempt in self.attempts.drain(..) {
            attempt.connection.close().await;
        }
    }
}

fn next_signal(
    attempts: &mut [Attempt],
) -> impl Future<Output = (usize, AttemptSignal)> + '_ {
    futures::future::poll_fn(move |cx| {
        for (position, attempt) in attempts.iter_mut().enumerate() {
            if let Some(events) = attempt.events.as_mut() {
                match events.poll_recv(cx) {
                    Poll::Ready(Some(event)) => {
                        return Poll::Ready((position, AttemptSignal::Rtc(event)));
                    }
                    Poll::Ready(None) => {
                        attempt.events = None;
                        return Poll::Ready((position, AttemptSignal::RtcEnded));
                    }
                    Poll::Pending => {}
                }
            }
            if let Some(ping_events) = attempt.ping_events.as_mut() {
                match ping_events.poll_recv(cx) {
                    Poll::Ready(Some(event)) => {
                        return Poll::Ready((position, AttemptSignal::Ping(event)));
                    }
                    Poll::Ready(None) => attempt.ping_events = None,
                    Poll::Pending => {}
                }
            }
        }
        Poll::Pending
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::loopback::{LoopbackNetwork, PathBehavior};

    fn config() -> RaceConfig {
        RaceConfig {
            settle: Duration::from_secs(5),
            deadline: Duration::from_secs(60),
            coalesce_idle: Duration::from_millis(1500),
            port_hint: None,
        }
    }

    fn stun(name: &str) -> IceServer {
        IceServer::stun(format!("stun:{name}:3478"))
    }

    fn connect_after(ms: u64) -> PathBehavior {
        PathBehavior::Connect {
            latency: Duration::from_millis(ms),
        }
    }

    fn forward(
        mut from: mpsc::UnboundedReceiver<LocalDescriptor>,
        to: mpsc::UnboundedSender<RaceInput>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(local) = from.recv().await {
                let _ = to.send(RaceInput::Remote {
                    attempt: local.attempt,
                    description: local.description,
                    candidates: local.candidates,
                    ice_servers: Some(local.ice_servers),
                });
            }
        })
    }

    struct Pair {
        initiator: RacerHandle,
        responder: RacerHandle,
        forwarders: [JoinHandle<()>; 2],
    }

    /// Starts an initiator and a responder wired to each other over loopback.
    fn pair(net: &LoopbackNetwork, partitions: Vec<Vec<IceServer>>) -> Pair {
        let (initiator_out, initiator_rx) = mpsc::unbounded_channel();
        let (responder_out, responder_rx) = mpsc::unbounded_channel();
        let initiator = CandidateRacer::start(
            "s",
            Arc::new(net.clone()),
            Role::Initiator,
            partitions.clone(),
            0,
            config(),
            initiator_out,
        );
        let responder = CandidateRacer::start(
            "s",
            Arc::new(net.clone()),
            Role::Responder,
            partitions,
            0,
            config(),
            responder_out,
        );
        let forwarders = [
            forward(initiator_rx, responder.inputs()),
            forward(responder_rx, initiator.inputs()),
        ];
        Pair {
            initiator,
            responder,
            forwarders,
        }
    }

    async fn race(
        net: &LoopbackNetwork,
        partitions: Vec<Vec<IceServer>>,
    ) -> (RaceOutcome, RaceOutcome) {
        let pair = pair(net, partitions);
        let outcomes = tokio::join!(pair.initiator.outcome(), pair.responder.outcome());
        for forwarder in pair.forwarders {
            forwarder.abort();
        }
        outcomes
    }

    fn closed_for(net: &LoopbackNetwork, server: &IceServer) -> bool {
        net.connections()
            .iter()
            .filter(|conn| conn.servers().contains(server))
            .all(|conn| conn.is_closed())
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn lowest_latency_attempt_wins_and_others_close() {
        let net = LoopbackNetwork::new();
        let (slow, fast) = (stun("slow"), stun("fast"));
        net.set_behavior(slow.url.clone(), connect_after(80));
        net.set_behavior(fast.url.clone(), connect_after(20));

        let (initiator, responder) = race(&net, vec![vec![slow.clone()], vec![fast.clone()]]).await;
        let RaceOutcome::Winner(initiator) = initiator else {
            panic!("initiator lost");
        };
        let RaceOutcome::Winner(responder) = responder else {
            panic!("responder lost");
        };
        assert_eq!(initiator.attempt, 1);
        assert_eq!(responder.attempt, 1);
        assert_eq!(initiator.latency, Some(Duration::from_millis(20)));
        assert_eq!(initiator.servers, vec![fast.clone()]);
        assert!(closed_for(&net, &slow));
        assert_eq!(initiator.connection.state(), ConnectionState::Connected);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn single_connecting_attempt_wins_over_blackholes() {
        let net = LoopbackNetwork::new();
        let servers = [stun("a"), stun("b"), stun("c")];
        net.set_behavior(servers[0].url.clone(), PathBehavior::Blackhole);
        net.set_behavior(servers[1].url.clone(), connect_after(30));
        net.set_behavior(servers[2].url.clone(), PathBehavior::Blackhole);
        let started = Instant::now();

        let partitions = servers.iter().map(|server| vec![server.clone()]).collect();
        let (initiator, _responder) = race(&net, partitions).await;
        let RaceOutcome::Winner(winner) = initiator else {
            panic!("expected a winner");
        };
        assert_eq!(winner.attempt, 1);
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(closed_for(&net, &servers[0]));
        assert!(closed_for(&net, &servers[2]));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn all_failing_attempts_resolve_without_winner() {
        let net = LoopbackNetwork::new();
        net.set_default_behavior(PathBehavior::Fail);
        let started = Instant::now();
        let pair = pair(&net, vec![vec![stun("a")], vec![stun("b")]]);

        let outcome = pair.initiator.outcome().await;
        assert!(matches!(outcome, RaceOutcome::NoWinner));
        assert!(started.elapsed() < Duration::from_secs(1));

        pair.responder.cancel();
        assert!(matches!(pair.responder.outcome().await, RaceOutcome::Cancelled));
        assert!(net.connections().iter().all(|conn| conn.is_closed()));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn silent_paths_hit_the_race_deadline() {
        let net = LoopbackNetwork::new();
        net.set_default_behavior(PathBehavior::Blackhole);
        let started = Instant::now();
        let (initiator, responder) = race(&net, vec![vec![stun("a")]]).await;
        assert!(matches!(initiator, RaceOutcome::NoWinner));
        assert!(matches!(responder, RaceOutcome::NoWinner));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(net.connections().iter().all(|conn| conn.is_closed()));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn cancel_closes_every_attempt() {
        let net = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let racer = CandidateRacer::start(
            "s",
            Arc::new(net.clone()),
            Role::Initiator,
            vec![vec![stun("a")], vec![stun("b")]],
            0,
            config(),
            tx,
        );
        racer.cancel();
        assert!(matches!(racer.outcome().await, RaceOutcome::Cancelled));
        assert!(net.connections().iter().all(|conn| conn.is_closed()));
    }
}
