//! The injected real-time connection capability.
//!
//! Everything above this module talks to peers through [`RtcFactory`],
//! [`RtcConnection`] and [`RtcDataChannel`]. `webrtc` provides the production
//! implementation; `loopback` is an in-process stand-in used by tests.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod loopback;
pub mod webrtc;

/// One STUN or TURN endpoint, serialized like a browser `RTCIceServer`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(rename = "urls")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// `host:port` without scheme or query, for plain UDP STUN probes.
    pub fn host_port(&self) -> Option<String> {
        let rest = self.url.split_once(':')?.1;
        let rest = rest.split('?').next().unwrap_or(rest);
        if rest.is_empty() {
            return None;
        }
        if rest.contains(':') {
            Some(rest.to_string())
        } else {
            Some(format!("{rest}:3478"))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub mid: String,
}

impl IceCandidate {
    fn fields(&self) -> Vec<&str> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        line.split_whitespace().collect()
    }

    /// Candidate type (`host`, `srflx`, `prflx`, `relay`).
    pub fn kind(&self) -> Option<String> {
        let fields = self.fields();
        fields
            .iter()
            .position(|field| *field == "typ")
            .and_then(|idx| fields.get(idx + 1))
            .map(|typ| typ.to_string())
    }

    pub fn address(&self) -> Option<(IpAddr, u16)> {
        let fields = self.fields();
        let ip = fields.get(4)?.parse().ok()?;
        let port = fields.get(5)?.parse().ok()?;
        Some((ip, port))
    }

    pub fn is_server_reflexive(&self) -> bool {
        self.kind().as_deref() == Some("srflx")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInit {
    pub ordered: bool,
    pub protocol: String,
}

impl ChannelInit {
    pub fn ordered(protocol: impl Into<String>) -> Self {
        Self {
            ordered: true,
            protocol: protocol.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Close,
}

pub enum RtcEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(ConnectionState),
    DataChannel(Arc<dyn RtcDataChannel>),
}

impl fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            RtcEvent::GatheringComplete => f.write_str("GatheringComplete"),
            RtcEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            RtcEvent::DataChannel(channel) => f
                .debug_struct("DataChannel")
                .field("label", &channel.label())
                .field("protocol", &channel.protocol())
                .finish(),
        }
    }
}

#[async_trait]
pub trait RtcFactory: Send + Sync {
    /// Creates a connection restricted to `servers`. `port_hint` asks the
    /// implementation to gather host candidates on that local UDP port.
    async fn create_connection(
        &self,
        servers: &[IceServer],
        port_hint: Option<u16>,
    ) -> Result<Arc<dyn RtcConnection>, TransportError>;
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn RtcDataChannel>, TransportError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    /// The event stream; events are buffered from creation until taken.
    /// Returns `None` once taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>>;
    fn state(&self) -> ConnectionState;
    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait RtcDataChannel: Send + Sync {
    fn label(&self) -> String;
    fn protocol(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
    /// Idempotent.
    async fn close(&self);
}

pub async fn send_text(channel: &dyn RtcDataChannel, text: impl Into<String>) -> Result<(), TransportError> {
    channel.send(ChannelMessage::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reflexive_candidate() {
        let candidate = IceCandidate {
            candidate: "candidate:842163049 1 udp 1677729535 203.0.113.7 51234 typ srflx raddr 192.168.1.4 rport 35565 generation 0".into(),
            mid: "0".into(),
        };
        assert!(candidate.is_server_reflexive());
        assert_eq!(
            candidate.address(),
            Some(("203.0.113.7".parse().expect("ip"), 51234))
        );
    }

    #[test]
    fn host_candidate_with_sdp_prefix() {
        let candidate = IceCandidate {
            candidate: "a=candidate:1 1 udp 2130706431 10.0.0.2 35565 typ host".into(),
            mid: String::new(),
        };
        assert_eq!(candidate.kind().as_deref(), Some("host"));
        assert_eq!(candidate.address().map(|(_, port)| port), Some(35565));
    }

    #[test]
    fn ice_server_shapes() {
        let stun = IceServer::stun("stun:stun.l.google.com:19302");
        assert!(!stun.is_turn());
        assert_eq!(stun.host_port().as_deref(), Some("stun.l.google.com:19302"));
        assert_eq!(
            IceServer::stun("stun:stun.qq.com").host_port().as_deref(),
            Some("stun.qq.com:3478")
        );

        let turn = IceServer::turn("turn:relay.example:3478?transport=udp", "u", "p");
        assert!(turn.is_turn());
        assert!(turn.has_credential());
        let json = serde_json::to_value(&turn).expect("json");
        assert_eq!(json["urls"], "turn:relay.example:3478?transport=udp");
    }
}
