use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-process random peer id. Rendered as a lowercase hyphenated uuid; the
/// derived order matches the order of those strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Exactly one side of any unordered pair initiates: the greater id.
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

/// Displayable profile exchanged through `ME` frames and `identity` messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub textures: BTreeMap<String, String>,
}

/// The local identity: fixed id, replaceable profile.
#[derive(Debug)]
pub struct LocalIdentity {
    id: PeerId,
    profile: RwLock<PeerProfile>,
}

impl LocalIdentity {
    pub fn new(id: PeerId, profile: PeerProfile) -> Self {
        Self {
            id,
            profile: RwLock::new(profile),
        }
    }

    pub fn generate(profile: PeerProfile) -> Self {
        Self::new(PeerId::random(), profile)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn profile(&self) -> PeerProfile {
        self.profile.read().clone()
    }

    pub fn set_profile(&self, profile: PeerProfile) {
        *self.profile.write() = profile;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_is_total_and_antisymmetric() {
        for _ in 0..256 {
            let a = PeerId::random();
            let b = PeerId::random();
            if a == b {
                continue;
            }
            assert_ne!(should_initiate(&a, &b), should_initiate(&b, &a));
        }
    }

    #[test]
    fn greater_string_id_initiates() {
        let a: PeerId = "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa".parse().expect("id");
        let b: PeerId = "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb".parse().expect("id");
        assert!(should_initiate(&b, &a));
        assert!(!should_initiate(&a, &b));
        assert_eq!(a.to_string() < b.to_string(), a < b);
    }

    #[test]
    fn profile_serializes_camel_case_without_empty_fields() {
        let profile = PeerProfile {
            name: "steve".into(),
            avatar: Some("https://skins.example/steve.png".into()),
            textures: BTreeMap::new(),
        };
        let json = serde_json::to_value(&profile).expect("json");
        assert_eq!(
            json,
            serde_json::json!({"name": "steve", "avatar": "https://skins.example/steve.png"})
        );
    }
}
