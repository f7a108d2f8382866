//! STUN/TURN discovery, testing and ranking.

mod cache;
mod discovery;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{PeerError, TransportError};
use crate::events::PeerEvent;
use crate::rtc::{ChannelInit, IceServer, RtcEvent, RtcFactory};

pub use cache::{load_cache, store_cache};
pub use discovery::{DiscoveryResponse, servers_from_discovery};

/// Public STUN servers tested on every start.
pub const BUILTIN_STUN: [&str; 9] = [
    "stun:stun.voipbuster.com:3478",
    "stun:stun.voipstunt.com:3478",
    "stun:stun.internetcalls.com:3478",
    "stun:stun.voip.aebc.com:3478",
    "stun:stun.qq.com:3478",
    "stun:stun.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

pub fn builtin_servers() -> Vec<IceServer> {
    BUILTIN_STUN.iter().map(|url| IceServer::stun(*url)).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Untested,
    Passed,
    Blocked,
}

#[derive(Clone, Debug)]
pub struct IceServerRecord {
    pub server: IceServer,
    pub status: ServerStatus,
    pub latency: Option<Duration>,
    pub tested_at: Option<SystemTime>,
}

impl IceServerRecord {
    fn new(server: IceServer) -> Self {
        Self {
            server,
            status: ServerStatus::Untested,
            latency: None,
            tested_at: None,
        }
    }

    pub fn validated(&self) -> bool {
        self.status == ServerStatus::Passed
    }

    /// Sort key: measured servers by latency, then trusted-but-unmeasured,
    /// then untested, then blocked.
    fn rank(&self) -> (u8, Duration) {
        match (self.status, self.latency) {
            (ServerStatus::Passed, Some(latency)) => (0, latency),
            (ServerStatus::Passed, None) => (1, Duration::ZERO),
            (ServerStatus::Untested, _) => (2, Duration::ZERO),
            (ServerStatus::Blocked, _) => (3, Duration::ZERO),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestReport {
    pub passed: bool,
    pub reflexive: Vec<IpAddr>,
    pub latency: Option<Duration>,
}

pub struct IceServerPool {
    config: PeerConfig,
    rtc: Arc<dyn RtcFactory>,
    http: reqwest::Client,
    records: RwLock<Vec<IceServerRecord>>,
    public_ips: Mutex<BTreeSet<IpAddr>>,
    events: broadcast::Sender<PeerEvent>,
}

impl IceServerPool {
    pub fn new(
        config: PeerConfig,
        rtc: Arc<dyn RtcFactory>,
        events: broadcast::Sender<PeerEvent>,
    ) -> Self {
        Self {
            config,
            rtc,
            http: reqwest::Client::new(),
            records: RwLock::new(Vec::new()),
            public_ips: Mutex::new(BTreeSet::new()),
            events,
        }
    }

    /// Loads the cache (trusted until re-tested), then tests cache and
    /// bootstrap servers together.
    pub async fn init(&self) {
        let cached = match self.config.ice_cache_path() {
            Some(path) => load_cache(&path).await,
            None => Vec::new(),
        };
        info!(
            target = "peerlink::ice",
            cached = cached.len(),
            "initializing ice server pool"
        );
        for server in &cached {
            self.upsert(server.clone(), |record| {
                if record.status == ServerStatus::Untested {
                    record.status = ServerStatus::Passed;
                }
            });
        }
        let mut pending = cached;
        for server in builtin_servers() {
            if !pending.iter().any(|known| known.url == server.url) {
                pending.push(server);
            }
        }
        self.test_all(pending).await;
        self.persist().await;
    }

    /// Merges the discovery endpoint's list into the pool and tests it.
    pub async fn update(&self) -> Result<(), PeerError> {
        let Some(url) = self.config.discovery_url.clone() else {
            return Ok(());
        };
        let response = self.http.post(&url).send().await?;
        if !response.status().is_success() {
            warn!(
                target = "peerlink::ice",
                status = %response.status(),
                "ice discovery endpoint refused"
            );
            return Ok(());
        }
        let discovered: DiscoveryResponse = response.json().await?;
        if let Some(meta) = discovered.meta.clone() {
            let _ = self.events.send(PeerEvent::IceMeta { meta });
        }
        let servers = servers_from_discovery(&discovered);
        debug!(
            target = "peerlink::ice",
            count = servers.len(),
            ttl = ?discovered.ttl,
            "discovered ice servers"
        );
        self.test_all(servers).await;
        self.persist().await;
        Ok(())
    }

    /// Tests one server in isolation. Servers carrying a credential pass
    /// without a gathering pass.
    pub async fn test(&self, server: &IceServer) -> Result<TestReport, TransportError> {
        if server.has_credential() {
            return Ok(TestReport {
                passed: true,
                reflexive: Vec::new(),
                latency: None,
            });
        }
        let started = Instant::now();
        let connection = self
            .rtc
            .create_connection(std::slice::from_ref(server), None)
            .await?;
        let Some(mut events) = connection.take_events() else {
            connection.close().await;
            return Err(TransportError::Setup("event stream already taken".into()));
        };
        let _channel = match connection
            .create_data_channel("test", ChannelInit::ordered("test"))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                connection.close().await;
                return Err(err);
            }
        };
        if let Err(err) = connection.create_offer().await {
            connection.close().await;
            return Err(err);
        }

        let mut reflexive = Vec::new();
        let mut latency = None;
        let gathering = async {
            while let Some(event) = events.recv().await {
                match event {
                    RtcEvent::LocalCandidate(candidate) if candidate.is_server_reflexive() => {
                        if let Some((ip, _)) = candidate.address() {
                            latency.get_or_insert_with(|| started.elapsed());
                            if !reflexive.contains(&ip) {
                                reflexive.push(ip);
                            }
                        }
                    }
                    RtcEvent::GatheringComplete => break,
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(self.config.ice_test_timeout, gathering)
            .await
            .is_err()
        {
            debug!(target = "peerlink::ice", url = %server.url, "ice gathering timed out");
        }
        connection.close().await;
        Ok(TestReport {
            passed: !reflexive.is_empty(),
            reflexive,
            latency,
        })
    }

    pub async fn test_all(&self, servers: Vec<IceServer>) {
        let servers: Vec<IceServer> = servers
            .into_iter()
            .filter(|server| self.config.allow_turn || !server.is_turn())
            .collect();
        join_all(servers.iter().map(|server| self.test_and_record(server))).await;
    }

    async fn test_and_record(&self, server: &IceServer) {
        let report = match self.test(server).await {
            Ok(report) => report,
            Err(err) => {
                debug!(target = "peerlink::ice", url = %server.url, error = %err, "ice test failed");
                TestReport {
                    passed: false,
                    reflexive: Vec::new(),
                    latency: None,
                }
            }
        };
        debug!(
            target = "peerlink::ice",
            url = %server.url,
            passed = report.passed,
            reflexive = ?report.reflexive,
            "tested ice server"
        );
        self.upsert(server.clone(), |record| {
            record.status = if report.passed {
                ServerStatus::Passed
            } else {
                ServerStatus::Blocked
            };
            record.latency = report.latency;
            record.tested_at = Some(SystemTime::now());
        });
        if report.passed {
            let _ = self.events.send(PeerEvent::IceServerValidated {
                server: server.clone(),
                latency: report.latency,
            });
        }
        for ip in report.reflexive {
            if self.public_ips.lock().insert(ip) {
                info!(target = "peerlink::ice", %ip, "observed public address");
                let _ = self.events.send(PeerEvent::PublicIp { ip });
            }
        }
    }

    fn upsert(&self, server: IceServer, update: impl FnOnce(&mut IceServerRecord)) {
        let mut records = self.records.write();
        match records.iter_mut().find(|record| record.server.url == server.url) {
            Some(record) => {
                record.server = server;
                update(record);
            }
            None => {
                let mut record = IceServerRecord::new(server);
                update(&mut record);
                records.push(record);
            }
        }
    }

    /// Inserts servers as already validated, skipping a test pass.
    pub fn trust(&self, servers: impl IntoIterator<Item = IceServer>) {
        for server in servers {
            self.upsert(server, |record| record.status = ServerStatus::Passed);
        }
    }

    pub fn records(&self) -> Vec<IceServerRecord> {
        self.records.read().clone()
    }

    pub fn observed_public_ips(&self) -> Vec<IpAddr> {
        self.public_ips.lock().iter().copied().collect()
    }

    /// Returns `(stuns, turns)`, ordered by `preferred` first and then by
    /// measured latency, with untested and blocked servers last. Falls back
    /// to every known server when none has passed.
    pub fn get(&self, preferred: &[IceServer]) -> (Vec<IceServer>, Vec<IceServer>) {
        let mut ranked: Vec<(usize, (u8, Duration), IceServer)> = {
            let records = self.records.read();
            let any_passed = records.iter().any(IceServerRecord::validated);
            records
                .iter()
                .filter(|record| !any_passed || record.validated())
                .map(|record| {
                    let preference = preferred
                        .iter()
                        .position(|wanted| wanted.url == record.server.url)
                        .unwrap_or(usize::MAX);
                    (preference, record.rank(), record.server.clone())
                })
                .collect()
        };
        ranked.sort_by_key(|(preference, rank, _)| (*preference, *rank));
        let servers: Vec<IceServer> = ranked.into_iter().map(|(_, _, server)| server).collect();

        let (turns, stuns): (Vec<IceServer>, Vec<IceServer>) =
            servers.into_iter().partition(IceServer::is_turn);
        let turns = if self.config.allow_turn {
            turns
        } else {
            Vec::new()
        };
        (stuns, turns)
    }

    pub async fn persist(&self) {
        let Some(path) = self.config.ice_cache_path() else {
            return;
        };
        let servers: Vec<IceServer> = self
            .records
            .read()
            .iter()
            .filter(|record| record.validated() && !record.server.has_credential())
            .map(|record| record.server.clone())
            .collect();
        if let Err(err) = store_cache(&path, &servers).await {
            warn!(
                target = "peerlink::ice",
                path = %path.display(),
                error = %err,
                "failed to write ice cache"
            );
        }
    }
}

/// Splits servers into one attempt's worth each: all STUN servers share one
/// partition, every TURN server gets its own (up to `max_turn`). With no
/// servers at all a single empty partition remains for host candidates.
pub fn partition(stuns: &[IceServer], turns: &[IceServer], max_turn: usize) -> Vec<Vec<IceServer>> {
    let mut partitions = Vec::new();
    if !stuns.is_empty() {
        partitions.push(stuns.to_vec());
    }
    for turn in turns.iter().take(max_turn) {
        partitions.push(vec![turn.clone()]);
    }
    if partitions.is_empty() {
        partitions.push(Vec::new());
    }
    partitions
}

/// Partitions for a relay-only retry: one per TURN server.
pub fn relay_partitions(turns: &[IceServer], max_turn: usize) -> Vec<Vec<IceServer>> {
    turns
        .iter()
        .take(max_turn)
        .map(|turn| vec![turn.clone()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::loopback::LoopbackNetwork;

    fn pool_with(net: &LoopbackNetwork) -> (IceServerPool, broadcast::Receiver<PeerEvent>) {
        let (events, rx) = broadcast::channel(64);
        let mut config = PeerConfig::default();
        config.cache_dir = None;
        config.discovery_url = None;
        config.ice_test_timeout = Duration::from_millis(200);
        (IceServerPool::new(config, Arc::new(net.clone()), events), rx)
    }

    #[test]
    fn stuns_share_a_partition_and_turns_stand_alone() {
        let stuns = vec![IceServer::stun("stun:a:1"), IceServer::stun("stun:b:1")];
        let turns = vec![
            IceServer::turn("turn:t1:3478", "u", "p"),
            IceServer::turn("turn:t2:3478", "u", "p"),
        ];
        let parts = partition(&stuns, &turns, 4);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], stuns);
        assert_eq!(parts[1], vec![turns[0].clone()]);

        assert_eq!(partition(&stuns, &turns, 1).len(), 2);
        assert_eq!(partition(&[], &[], 4), vec![Vec::<IceServer>::new()]);
        assert!(relay_partitions(&[], 4).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reflexive_discovery_passes_and_reports_public_ip() {
        let net = LoopbackNetwork::new();
        net.set_reflexive("stun:good:3478", "198.51.100.9:40001".parse().expect("addr"));
        let (pool, mut events) = pool_with(&net);

        let good = IceServer::stun("stun:good:3478");
        let bad = IceServer::stun("stun:bad:3478");
        pool.test_all(vec![good.clone(), bad.clone()]).await;

        let records = pool.records();
        let status = |url: &str| {
            records
                .iter()
                .find(|record| record.server.url == url)
                .map(|record| record.status)
        };
        assert_eq!(status("stun:good:3478"), Some(ServerStatus::Passed));
        assert_eq!(status("stun:bad:3478"), Some(ServerStatus::Blocked));
        assert_eq!(
            pool.observed_public_ips(),
            vec!["198.51.100.9".parse::<IpAddr>().expect("ip")]
        );

        let mut saw_ip = false;
        let mut saw_validated = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PeerEvent::PublicIp { .. } => saw_ip = true,
                PeerEvent::IceServerValidated { server, .. } => {
                    assert_eq!(server, good);
                    saw_validated = true;
                }
                _ => {}
            }
        }
        assert!(saw_ip && saw_validated);
        assert!(net.connections().iter().all(|conn| conn.is_closed()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn credentialed_servers_pass_without_gathering() {
        let net = LoopbackNetwork::new();
        let (pool, _events) = pool_with(&net);
        let report = pool
            .test(&IceServer::turn("turn:relay:3478", "user", "secret"))
            .await
            .expect("report");
        assert!(report.passed);
        assert!(net.connections().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn get_prefers_caller_order_and_falls_back_to_blocked() {
        let net = LoopbackNetwork::new();
        let (pool, _events) = pool_with(&net);
        let a = IceServer::stun("stun:a:3478");
        let b = IceServer::stun("stun:b:3478");
        let t = IceServer::turn("turn:t:3478", "u", "p");
        pool.test_all(vec![a.clone(), b.clone()]).await;

        // Nothing passed: everything known is returned instead of nothing.
        let (stuns, turns) = pool.get(&[]);
        assert_eq!(stuns.len(), 2);
        assert!(turns.is_empty());

        pool.trust([a.clone(), b.clone(), t.clone()]);
        let (stuns, turns) = pool.get(&[b.clone()]);
        assert_eq!(stuns, vec![b, a]);
        assert_eq!(turns, vec![t]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn get_breaks_preference_ties_by_latency() {
        let net = LoopbackNetwork::new();
        let (pool, _events) = pool_with(&net);
        let measured = |url: &str, millis: u64| {
            let server = IceServer::stun(url);
            pool.upsert(server.clone(), |record| {
                record.status = ServerStatus::Passed;
                record.latency = Some(Duration::from_millis(millis));
            });
            server
        };
        let slow = measured("stun:slow:3478", 300);
        let fast = measured("stun:fast:3478", 20);
        let middle = measured("stun:middle:3478", 90);
        let trusted = IceServer::stun("stun:trusted:3478");
        pool.trust([trusted.clone()]);
        pool.upsert(IceServer::stun("stun:blocked:3478"), |record| {
            record.status = ServerStatus::Blocked;
        });

        let (stuns, _) = pool.get(&[]);
        assert_eq!(stuns, vec![fast.clone(), middle.clone(), slow.clone(), trusted.clone()]);

        let (stuns, _) = pool.get(&[slow.clone()]);
        assert_eq!(stuns, vec![slow, fast, middle, trusted]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn fallback_puts_untested_ahead_of_blocked() {
        let net = LoopbackNetwork::new();
        let (pool, _events) = pool_with(&net);
        let blocked = IceServer::stun("stun:blocked:3478");
        let fresh = IceServer::stun("stun:fresh:3478");
        pool.upsert(blocked.clone(), |record| record.status = ServerStatus::Blocked);
        pool.upsert(fresh.clone(), |_| {});

        let (stuns, _) = pool.get(&[]);
        assert_eq!(stuns, vec![fresh, blocked]);
    }
}
