use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{PeerId, PeerProfile};
use crate::rtc::{IceCandidate, IceServer, SdpKind};

pub const HEARTBEAT_LEN: usize = 24;
pub const LEGACY_HEARTBEAT_LEN: usize = 16;

/// Signaling payload for one connection attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub receiver: PeerId,
    pub sender: PeerId,
    pub sdp: String,
    pub sdp_type: SdpKind,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServer>>,
}

/// JSON text frames exchanged through the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayFrame {
    #[serde(rename = "DESCRIPTOR")]
    Descriptor(Descriptor),
    #[serde(rename = "DESCRIPTOR-ECHO")]
    DescriptorEcho {
        receiver: PeerId,
        sender: PeerId,
        id: u64,
    },
    #[serde(rename = "WHO")]
    Who {
        receiver: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<PeerId>,
    },
    #[serde(rename = "ME")]
    Me { sender: PeerId, profile: PeerProfile },
    #[serde(rename = "PONG")]
    Pong { timestamp: u64 },
}

const KNOWN_TYPES: [&str; 5] = ["DESCRIPTOR", "DESCRIPTOR-ECHO", "WHO", "ME", "PONG"];

impl RelayFrame {
    /// `None` for frames addressed to everybody.
    pub fn receiver(&self) -> Option<&PeerId> {
        match self {
            RelayFrame::Descriptor(descriptor) => Some(&descriptor.receiver),
            RelayFrame::DescriptorEcho { receiver, .. } | RelayFrame::Who { receiver, .. } => {
                Some(receiver)
            }
            RelayFrame::Me { .. } | RelayFrame::Pong { .. } => None,
        }
    }

    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            RelayFrame::Descriptor(descriptor) => Some(&descriptor.sender),
            RelayFrame::DescriptorEcho { sender, .. } | RelayFrame::Me { sender, .. } => {
                Some(sender)
            }
            RelayFrame::Who { sender, .. } => sender.as_ref(),
            RelayFrame::Pong { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing type".into()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}

/// Binary presence frame: the sender's 16 id bytes followed by its clock as
/// big-endian unix milliseconds. Older peers send the id alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub peer: PeerId,
    pub timestamp: Option<u64>,
}

impl Heartbeat {
    pub fn encode(peer: &PeerId, timestamp: u64) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEARTBEAT_LEN);
        frame.extend_from_slice(peer.as_bytes());
        frame.extend_from_slice(&timestamp.to_be_bytes());
        frame
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        let id: [u8; 16] = frame.get(..LEGACY_HEARTBEAT_LEN)?.try_into().ok()?;
        let timestamp = match frame.len() {
            LEGACY_HEARTBEAT_LEN => None,
            HEARTBEAT_LEN => {
                let raw: [u8; 8] = frame[LEGACY_HEARTBEAT_LEN..].try_into().ok()?;
                Some(u64::from_be_bytes(raw))
            }
            _ => return None,
        };
        Some(Self {
            peer: PeerId::from_bytes(id),
            timestamp,
        })
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
