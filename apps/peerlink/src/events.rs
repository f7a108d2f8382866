use std::net::IpAddr;
use std::time::Duration;

use crate::identity::{PeerId, PeerProfile};
use crate::nat::NatVerdict;
use crate::rtc::IceServer;
use crate::session::SessionState;
use crate::session::messages::SharedManifest;
use crate::signaling::RelayState;

/// Everything the engine reports to its consumer. Delivered through a
/// `tokio::sync::broadcast` channel; slow subscribers may observe `Lagged`.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    ConnectionState {
        session: String,
        remote: Option<PeerId>,
        state: SessionState,
    },
    /// Base64 transfer description for manual copy/paste signaling.
    LocalDescription {
        session: String,
        description: String,
    },
    Identity {
        session: Option<String>,
        peer: Option<PeerId>,
        profile: PeerProfile,
    },
    ManifestShared {
        session: String,
        manifest: SharedManifest,
    },
    LanDiscovered {
        session: String,
        remote_port: u16,
        local_port: u16,
        motd: String,
    },
    Latency {
        session: String,
        latency: Duration,
    },
    GroupState {
        group: String,
        state: RelayState,
    },
    GroupJoined {
        group: String,
    },
    GroupLeft {
        group: String,
    },
    GroupError {
        group: String,
        error: String,
    },
    RelayPing {
        group: String,
        rtt: Duration,
    },
    IceServerValidated {
        server: IceServer,
        latency: Option<Duration>,
    },
    PublicIp {
        ip: IpAddr,
    },
    IceMeta {
        meta: serde_json::Value,
    },
    NatType {
        verdict: NatVerdict,
    },
    NoWinner {
        session: String,
        remote: Option<PeerId>,
    },
}
