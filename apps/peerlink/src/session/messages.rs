//! Control-channel envelopes: `{"type": ..., "payload": ...}` text frames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::identity::PeerProfile;

/// One LAN game server the sender is hosting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanServer {
    pub port: u16,
    #[serde(default)]
    pub motd: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedFile {
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The instance a peer shares. Only `files[].path` is interpreted here;
/// everything else is carried through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedManifest {
    #[serde(default)]
    pub files: Vec<SharedFile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SharedManifest {
    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|file| file.path == path)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    Identity(PeerProfile),
    HeartbeatPing { time: u64 },
    HeartbeatPong { time: u64 },
    Lan { servers: Vec<LanServer> },
    ShareManifest(SharedManifest),
    GetSharedManifest,
}

const KNOWN_TYPES: [&str; 6] = [
    "identity",
    "heartbeat-ping",
    "heartbeat-pong",
    "lan",
    "share-manifest",
    "get-shared-manifest",
];

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Identity(_) => "identity",
            Message::HeartbeatPing { .. } => "heartbeat-ping",
            Message::HeartbeatPong { .. } => "heartbeat-pong",
            Message::Lan { .. } => "lan",
            Message::ShareManifest(_) => "share-manifest",
            Message::GetSharedManifest => "get-shared-manifest",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    /// Unknown types are reported separately so callers can ignore them
    /// without treating the frame as corrupt.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        if !KNOWN_TYPES.contains(&envelope.kind.as_str()) {
            return Err(ProtocolError::UnknownType(envelope.kind));
        }
        let mut normalized = Map::new();
        normalized.insert("type".into(), Value::String(envelope.kind));
        if !envelope.payload.is_null() {
            normalized.insert("payload".into(), envelope.payload);
        }
        serde_json::from_value(Value::Object(normalized))
            .map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}
