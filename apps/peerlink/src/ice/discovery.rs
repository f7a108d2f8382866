use serde::Deserialize;

use crate::rtc::IceServer;

/// Body returned by the discovery endpoint. Only `stuns` is always present;
/// the TURN fields come together when relay credentials are issued.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(default)]
    pub stuns: Vec<String>,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// TURN uris go in front (each one prepended in turn), STUN hosts follow.
pub fn servers_from_discovery(response: &DiscoveryResponse) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = response
        .stuns
        .iter()
        .map(|host| {
            if host.starts_with("stun:") {
                IceServer::stun(host.clone())
            } else {
                IceServer::stun(format!("stun:{host}"))
            }
        })
        .collect();
    for uri in &response.uris {
        servers.insert(
            0,
            IceServer {
                url: uri.clone(),
                username: response.username.clone(),
                credential: response.password.clone(),
            },
        );
    }
    servers
}
