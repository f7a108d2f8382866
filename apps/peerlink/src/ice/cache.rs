use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::rtc::IceServer;

/// Accepted shapes of one cache entry. Older releases stored bare
/// `{hostname, port}` STUN records.
#[derive(Deserialize)]
#[serde(untagged)]
enum CachedServer {
    Legacy {
        hostname: String,
        port: u16,
    },
    Single(IceServer),
    Multi {
        urls: Vec<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        credential: Option<String>,
    },
}

impl CachedServer {
    fn into_servers(self) -> Vec<IceServer> {
        match self {
            CachedServer::Legacy { hostname, port } => {
                vec![IceServer::stun(format!("stun:{hostname}:{port}"))]
            }
            CachedServer::Single(server) => vec![server],
            CachedServer::Multi {
                urls,
                username,
                credential,
            } => urls
                .into_iter()
                .map(|url| IceServer {
                    url,
                    username: username.clone(),
                    credential: credential.clone(),
                })
                .collect(),
        }
    }
}

pub fn parse_cache(content: &str) -> Vec<IceServer> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(content) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(target = "peerlink::ice", error = %err, "ignoring unreadable ice cache");
            return Vec::new();
        }
    };
    entries
        .into_iter()
        .filter(|entry| entry.is_object())
        .filter_map(|entry| serde_json::from_value::<CachedServer>(entry).ok())
        .flat_map(CachedServer::into_servers)
        .collect()
}

/// Missing or unreadable caches yield an empty list.
pub async fn load_cache(path: &Path) -> Vec<IceServer> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let servers = parse_cache(&content);
            debug!(
                target = "peerlink::ice",
                path = %path.display(),
                count = servers.len(),
                "loaded ice cache"
            );
            servers
        }
        Err(err) => {
            debug!(target = "peerlink::ice", path = %path.display(), error = %err, "no ice cache");
            Vec::new()
        }
    }
}

pub async fn store_cache(path: &Path, servers: &[IceServer]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_vec_pretty(servers).map_err(std::io::Error::other)?;
    tokio::fs::write(path, content).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_legacy_and_multi_url_entries() {
        let content = r#"[
            {"urls": "stun:stun.qq.com:3478"},
            {"hostname": "stun.l.google.com", "port": 19302},
            {"urls": ["turn:a:3478", "turn:b:3478"], "username": "u", "credential": "p"},
            "garbage",
            {"unrelated": true}
        ]"#;
        let servers = parse_cache(content);
        let urls: Vec<&str> = servers.iter().map(|server| server.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "stun:stun.qq.com:3478",
                "stun:stun.l.google.com:19302",
                "turn:a:3478",
                "turn:b:3478"
            ]
        );
        assert_eq!(servers[3].credential.as_deref(), Some("p"));
    }

    #[test]
    fn corrupt_cache_is_empty() {
        assert!(parse_cache("{not json").is_empty());
        assert!(parse_cache("{}").is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn store_then_load() {
        let dir = std::env::temp_dir().join(format!("peerlink-ice-{}", uuid::Uuid::new_v4()));
        let path = dir.join("ice-servers.json");
        let servers = vec![IceServer::stun("stun:stun.qq.com:3478")];
        store_cache(&path, &servers).await.expect("store");
        assert_eq!(load_cache(&path).await, servers);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
