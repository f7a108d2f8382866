//! NAT behaviour classification and gateway port mapping.
//!
//! The verdict is advisory. Connection attempts never wait on it and never
//! change course because of it; it only feeds the consumer's diagnostics.

pub mod mapping;
pub mod stun;

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::PeerConfig;
use crate::events::PeerEvent;

pub use mapping::{MappingPool, MappingProtocol, PortMapper, PortMapping};
pub use stun::BindingReply;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatType {
    #[serde(rename = "Blocked")]
    Blocked,
    #[serde(rename = "Open Internet")]
    OpenInternet,
    #[serde(rename = "Full Cone")]
    FullCone,
    #[serde(rename = "Symmetric UDP Firewall")]
    SymmetricUdpFirewall,
    #[serde(rename = "Restrict NAT")]
    Restricted,
    #[serde(rename = "Restrict Port NAT")]
    PortRestricted,
    #[serde(rename = "Symmetric NAT")]
    Symmetric,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NatType::Blocked => "Blocked",
            NatType::OpenInternet => "Open Internet",
            NatType::FullCone => "Full Cone",
            NatType::SymmetricUdpFirewall => "Symmetric UDP Firewall",
            NatType::Restricted => "Restrict NAT",
            NatType::PortRestricted => "Restrict Port NAT",
            NatType::Symmetric => "Symmetric NAT",
            NatType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatVerdict {
    pub nat_type: NatType,
    /// Set on the fast first-reply verdict that refinement may still revise.
    pub provisional: bool,
    /// Set when no probe answered and the verdict leans on public addresses
    /// seen earlier through ICE gathering.
    pub heuristic: bool,
    pub mapped: Option<SocketAddr>,
}

impl NatVerdict {
    fn new(nat_type: NatType) -> Self {
        Self {
            nat_type,
            provisional: false,
            heuristic: false,
            mapped: None,
        }
    }
}

pub struct NatClassifier {
    config: PeerConfig,
    events: broadcast::Sender<PeerEvent>,
}

impl NatClassifier {
    pub fn new(config: PeerConfig, events: broadcast::Sender<PeerEvent>) -> Self {
        Self { config, events }
    }

    /// Probes `servers` (`host:port`) from one local socket. The first reply
    /// is published as a provisional verdict before the jittered refinement
    /// rounds run.
    pub async fn classify(&self, servers: &[String], observed_public: &[IpAddr]) -> NatVerdict {
        let targets = resolve(servers).await;
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!(target = "peerlink::nat", error = %err, "failed to bind probe socket");
                return self.publish(NatVerdict::new(NatType::Unknown));
            }
        };
        let local_port = socket.local_addr().map(|addr| addr.port()).unwrap_or_default();

        let first = stun::probe_all(&socket, &targets, self.config.stun_probe_timeout).await;
        let Some(fastest) = first.first().copied() else {
            let verdict = if observed_public.is_empty() {
                NatVerdict::new(NatType::Blocked)
            } else {
                NatVerdict {
                    heuristic: true,
                    ..NatVerdict::new(NatType::Symmetric)
                }
            };
            info!(
                target = "peerlink::nat",
                nat = %verdict.nat_type,
                heuristic = verdict.heuristic,
                "no stun server answered"
            );
            return self.publish(verdict);
        };

        let local = is_local_address(fastest.mapped.ip());
        let provisional = NatVerdict {
            provisional: true,
            mapped: Some(fastest.mapped),
            ..NatVerdict::new(if local {
                NatType::OpenInternet
            } else {
                NatType::PortRestricted
            })
        };
        debug!(
            target = "peerlink::nat",
            nat = %provisional.nat_type,
            server = %fastest.server,
            mapped = %fastest.mapped,
            "provisional nat verdict"
        );
        self.publish(provisional.clone());
        if local {
            return self.publish(NatVerdict {
                provisional: false,
                ..provisional
            });
        }

        let mut samples = first;
        for round in 0..self.config.nat_refine_rounds {
            let jitter = jitter_up_to(self.config.nat_refine_jitter);
            tokio::time::sleep(jitter).await;
            let replies = stun::probe_all(&socket, &targets, self.config.stun_probe_timeout).await;
            debug!(
                target = "peerlink::nat",
                round,
                replies = replies.len(),
                "nat refinement round"
            );
            samples.extend(replies);
        }

        let verdict = NatVerdict {
            nat_type: refine(&samples, local_port),
            provisional: false,
            heuristic: false,
            mapped: Some(fastest.mapped),
        };
        info!(target = "peerlink::nat", nat = %verdict.nat_type, "nat classified");
        self.publish(verdict)
    }

    fn publish(&self, verdict: NatVerdict) -> NatVerdict {
        let _ = self.events.send(PeerEvent::NatType {
            verdict: verdict.clone(),
        });
        verdict
    }
}

/// Different mappings for different destinations mean a symmetric NAT. A
/// single stable mapping that keeps the local port looks like a full cone.
fn refine(samples: &[BindingReply], local_port: u16) -> NatType {
    let mappings: HashSet<SocketAddr> = samples.iter().map(|reply| reply.mapped).collect();
    let servers: HashSet<SocketAddr> = samples.iter().map(|reply| reply.server).collect();
    if mappings.len() > 1 {
        return NatType::Symmetric;
    }
    match mappings.into_iter().next() {
        Some(mapped) if servers.len() > 1 && mapped.port() == local_port => NatType::FullCone,
        Some(_) => NatType::PortRestricted,
        None => NatType::Unknown,
    }
}

fn jitter_up_to(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn is_local_address(ip: IpAddr) -> bool {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().any(|iface| iface.ip() == ip),
        Err(_) => false,
    }
}

async fn resolve(servers: &[String]) -> Vec<SocketAddr> {
    let mut targets = Vec::new();
    for server in servers {
        match tokio::net::lookup_host(server.as_str()).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.find(SocketAddr::is_ipv4) {
                    if !targets.contains(&addr) {
                        targets.push(addr);
                    }
                }
            }
            Err(err) => {
                debug!(target = "peerlink::nat", %server, error = %err, "stun host did not resolve")
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::testing::spawn_responder;

    fn classifier() -> (NatClassifier, broadcast::Receiver<PeerEvent>) {
        let (events, rx) = broadcast::channel(16);
        let config = PeerConfig {
            stun_probe_timeout: Duration::from_millis(300),
            nat_refine_rounds: 2,
            nat_refine_jitter: Duration::from_millis(5),
            ..PeerConfig::default()
        };
        (NatClassifier::new(config, events), rx)
    }

    fn verdicts(rx: &mut broadcast::Receiver<PeerEvent>) -> Vec<NatVerdict> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::NatType { verdict } = event {
                out.push(verdict);
            }
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn unmapped_source_is_open_internet() {
        let (server, handle) = spawn_responder(|from| from).await;
        let (nat, mut rx) = classifier();
        let verdict = nat.classify(&[server.to_string()], &[]).await;
        assert_eq!(verdict.nat_type, NatType::OpenInternet);
        assert!(!verdict.provisional);
        let published = verdicts(&mut rx);
        assert!(published[0].provisional);
        handle.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn destination_dependent_mapping_is_symmetric() {
        let (a, a_handle) =
            spawn_responder(|from| SocketAddr::new([203, 0, 113, 5].into(), from.port() ^ 1)).await;
        let (b, b_handle) =
            spawn_responder(|from| SocketAddr::new([203, 0, 113, 5].into(), from.port() ^ 2)).await;
        let (nat, mut rx) = classifier();
        let verdict = nat.classify(&[a.to_string(), b.to_string()], &[]).await;
        assert_eq!(verdict.nat_type, NatType::Symmetric);

        let published = verdicts(&mut rx);
        assert_eq!(published.first().map(|v| v.nat_type), Some(NatType::PortRestricted));
        assert!(published.first().is_some_and(|v| v.provisional));
        a_handle.abort();
        b_handle.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn stable_port_preserving_mapping_is_full_cone() {
        let public = |from: SocketAddr| SocketAddr::new([198, 51, 100, 1].into(), from.port());
        let (a, a_handle) = spawn_responder(public).await;
        let (b, b_handle) = spawn_responder(public).await;
        let (nat, _rx) = classifier();
        let verdict = nat.classify(&[a.to_string(), b.to_string()], &[]).await;
        assert_eq!(verdict.nat_type, NatType::FullCone);
        a_handle.abort();
        b_handle.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn silence_is_blocked_unless_public_ips_were_seen() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let target = silent.local_addr().expect("addr").to_string();
        let (nat, _rx) = classifier();

        let verdict = nat.classify(std::slice::from_ref(&target), &[]).await;
        assert_eq!(verdict.nat_type, NatType::Blocked);

        let seen: IpAddr = "203.0.113.9".parse().expect("ip");
        let verdict = nat.classify(&[target], &[seen]).await;
        assert_eq!(verdict.nat_type, NatType::Symmetric);
        assert!(verdict.heuristic);
    }

    #[test]
    fn nat_type_wire_names() {
        assert_eq!(
            serde_json::to_value(NatType::PortRestricted).expect("json"),
            "Restrict Port NAT"
        );
        assert_eq!(NatType::OpenInternet.to_string(), "Open Internet");
    }
}
