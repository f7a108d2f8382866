use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use tracing::warn;
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "wss://api.xmcl.app";
pub const DEFAULT_DISCOVERY_URL: &str = "https://api.xmcl.app/rtc/official";
pub const DEFAULT_PORT_HINT: u16 = 35565;
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 32;
pub const ICE_CACHE_FILE: &str = "ice-servers.json";

const MIN_CHUNK_BYTES: usize = 1024;

/// Runtime settings for a [`crate::network::PeerNetwork`].
///
/// `Default` gives the production timings; [`PeerConfig::from_env`] layers
/// `PEERLINK_*` overrides on top and falls back to the default for any value
/// that is missing, unparsable or below its floor.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub relay_url: String,
    pub discovery_url: Option<String>,
    pub cache_dir: Option<PathBuf>,

    pub relay_heartbeat: Duration,
    pub descriptor_retry: Duration,
    pub descriptor_cutoff: Duration,
    pub relay_idle_timeout: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,

    pub ice_test_timeout: Duration,
    pub settle_timeout: Duration,
    pub race_deadline: Duration,
    pub coalesce_idle: Duration,
    pub max_turn_partitions: usize,
    pub allow_turn: bool,
    pub relay_fallback: bool,

    pub session_heartbeat: Duration,
    pub disconnect_grace: Duration,
    pub reconnect_attempts: u32,

    pub port_hint: Option<u16>,
    pub proxy_bind_host: IpAddr,
    pub lan_target_host: IpAddr,
    pub download_concurrency: usize,
    pub chunk_bytes: usize,

    pub stun_probe_timeout: Duration,
    pub nat_refine_rounds: u32,
    pub nat_refine_jitter: Duration,

    pub shared_image_dir: Option<PathBuf>,
    pub shared_assets_dir: Option<PathBuf>,
    pub shared_libraries_dir: Option<PathBuf>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            discovery_url: Some(DEFAULT_DISCOVERY_URL.to_string()),
            cache_dir: default_cache_dir(),

            relay_heartbeat: Duration::from_secs(4),
            descriptor_retry: Duration::from_secs(4),
            descriptor_cutoff: Duration::from_secs(120),
            relay_idle_timeout: Duration::from_secs(31),
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),

            ice_test_timeout: Duration::from_secs(5),
            settle_timeout: Duration::from_secs(5),
            race_deadline: Duration::from_secs(60),
            coalesce_idle: Duration::from_millis(1500),
            max_turn_partitions: 4,
            allow_turn: true,
            relay_fallback: true,

            session_heartbeat: Duration::from_secs(1),
            disconnect_grace: Duration::from_secs(10),
            reconnect_attempts: 3,

            port_hint: Some(DEFAULT_PORT_HINT),
            proxy_bind_host: IpAddr::from([0, 0, 0, 0]),
            lan_target_host: IpAddr::from([127, 0, 0, 1]),
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            chunk_bytes: DEFAULT_CHUNK_BYTES,

            stun_probe_timeout: Duration::from_secs(3),
            nat_refine_rounds: 3,
            nat_refine_jitter: Duration::from_millis(250),

            shared_image_dir: None,
            shared_assets_dir: None,
            shared_libraries_dir: None,
        }
    }
}

impl PeerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_url: parse_url_env("PEERLINK_RELAY_URL").unwrap_or(defaults.relay_url),
            discovery_url: match std::env::var("PEERLINK_DISCOVERY_URL") {
                Ok(value) if value.trim().is_empty() || value.trim() == "off" => None,
                Ok(_) => parse_url_env("PEERLINK_DISCOVERY_URL").or(defaults.discovery_url),
                Err(_) => defaults.discovery_url,
            },
            cache_dir: std::env::var_os("PEERLINK_CACHE_DIR")
                .map(PathBuf::from)
                .or(defaults.cache_dir),

            relay_heartbeat: parse_millis_env(
                "PEERLINK_RELAY_HEARTBEAT_MS",
                defaults.relay_heartbeat,
                100,
            ),
            descriptor_retry: parse_millis_env(
                "PEERLINK_DESCRIPTOR_RETRY_MS",
                defaults.descriptor_retry,
                100,
            ),
            descriptor_cutoff: parse_millis_env(
                "PEERLINK_DESCRIPTOR_CUTOFF_MS",
                defaults.descriptor_cutoff,
                1_000,
            ),
            relay_idle_timeout: parse_millis_env(
                "PEERLINK_RELAY_IDLE_MS",
                defaults.relay_idle_timeout,
                1_000,
            ),
            reconnect_backoff_min: defaults.reconnect_backoff_min,
            reconnect_backoff_max: parse_millis_env(
                "PEERLINK_RECONNECT_BACKOFF_MAX_MS",
                defaults.reconnect_backoff_max,
                1_000,
            ),

            ice_test_timeout: parse_millis_env(
                "PEERLINK_ICE_TEST_TIMEOUT_MS",
                defaults.ice_test_timeout,
                500,
            ),
            settle_timeout: parse_millis_env(
                "PEERLINK_SETTLE_MS",
                defaults.settle_timeout,
                0,
            ),
            race_deadline: parse_millis_env(
                "PEERLINK_RACE_DEADLINE_MS",
                defaults.race_deadline,
                1_000,
            ),
            coalesce_idle: parse_millis_env(
                "PEERLINK_COALESCE_MS",
                defaults.coalesce_idle,
                0,
            ),
            max_turn_partitions: parse_usize_env(
                "PEERLINK_MAX_TURN_PARTITIONS",
                defaults.max_turn_partitions,
                1,
            ),
            allow_turn: parse_bool_env("PEERLINK_ALLOW_TURN").unwrap_or(defaults.allow_turn),
            relay_fallback: parse_bool_env("PEERLINK_RELAY_FALLBACK")
                .unwrap_or(defaults.relay_fallback),

            session_heartbeat: parse_millis_env(
                "PEERLINK_SESSION_HEARTBEAT_MS",
                defaults.session_heartbeat,
                100,
            ),
            disconnect_grace: parse_millis_env(
                "PEERLINK_DISCONNECT_GRACE_MS",
                defaults.disconnect_grace,
                0,
            ),
            reconnect_attempts: parse_usize_env(
                "PEERLINK_RECONNECT_ATTEMPTS",
                defaults.reconnect_attempts as usize,
                0,
            ) as u32,

            port_hint: match std::env::var("PEERLINK_PORT_HINT") {
                Ok(value) if value.trim() == "0" => None,
                Ok(_) => Some(parse_usize_env(
                    "PEERLINK_PORT_HINT",
                    DEFAULT_PORT_HINT as usize,
                    1,
                )
                .min(u16::MAX as usize) as u16),
                Err(_) => defaults.port_hint,
            },
            proxy_bind_host: parse_ip_env("PEERLINK_PROXY_BIND_HOST")
                .unwrap_or(defaults.proxy_bind_host),
            lan_target_host: parse_ip_env("PEERLINK_LAN_TARGET_HOST")
                .unwrap_or(defaults.lan_target_host),
            download_concurrency: parse_usize_env(
                "PEERLINK_DOWNLOAD_CONCURRENCY",
                defaults.download_concurrency,
                1,
            ),
            chunk_bytes: parse_usize_env(
                "PEERLINK_CHUNK_BYTES",
                defaults.chunk_bytes,
                MIN_CHUNK_BYTES,
            ),

            stun_probe_timeout: parse_millis_env(
                "PEERLINK_STUN_TIMEOUT_MS",
                defaults.stun_probe_timeout,
                100,
            ),
            nat_refine_rounds: defaults.nat_refine_rounds,
            nat_refine_jitter: defaults.nat_refine_jitter,

            shared_image_dir: std::env::var_os("PEERLINK_SHARED_IMAGE_DIR").map(PathBuf::from),
            shared_assets_dir: std::env::var_os("PEERLINK_SHARED_ASSETS_DIR").map(PathBuf::from),
            shared_libraries_dir: std::env::var_os("PEERLINK_SHARED_LIBRARIES_DIR")
                .map(PathBuf::from),
        }
    }

    pub fn ice_cache_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(ICE_CACHE_FILE))
    }

    /// Group socket endpoint, `<relay>/group/<id>`.
    pub fn group_url(&self, group: &str) -> Result<Url, url::ParseError> {
        let base = self.relay_url.trim_end_matches('/');
        Url::parse(&format!("{base}/group/{}", encode_segment(group)))
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn default_cache_dir() -> Option<PathBuf> {
    ProjectDirs::from("app", "peerlink", "peerlink").map(|dirs| dirs.cache_dir().to_path_buf())
}

fn parse_url_env(var: &str) -> Option<String> {
    let value = std::env::var(var).ok()?;
    match Url::parse(value.trim()) {
        Ok(url) => Some(url.to_string()),
        Err(err) => {
            warn!(target = "peerlink::config", var, error = %err, "invalid url; using default");
            None
        }
    }
}

fn parse_ip_env(var: &str) -> Option<IpAddr> {
    let value = std::env::var(var).ok()?;
    match value.trim().parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(err) => {
            warn!(target = "peerlink::config", var, error = %err, "invalid address; using default");
            None
        }
    }
}

fn parse_bool_env(var: &str) -> Option<bool> {
    std::env::var(var)
        .ok()
        .map(|value| !matches!(value.trim(), "" | "0" | "false" | "off" | "no"))
}

fn parse_millis_env(var: &str, default: Duration, min_ms: u64) -> Duration {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(parsed) if parsed >= min_ms => Duration::from_millis(parsed),
            Ok(parsed) => {
                warn!(
                    target = "peerlink::config",
                    var, parsed, min_ms, "duration below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "peerlink::config",
                    var,
                    error = %err,
                    "failed to parse duration; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "peerlink::config",
                    var, parsed, min, default, "value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "peerlink::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse value; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_timings() {
        let config = PeerConfig::default();
        assert_eq!(config.relay_heartbeat, Duration::from_secs(4));
        assert_eq!(config.descriptor_cutoff, Duration::from_secs(120));
        assert_eq!(config.coalesce_idle, Duration::from_millis(1500));
        assert_eq!(config.port_hint, Some(35565));
        assert_eq!(config.chunk_bytes, 16 * 1024);
        assert_eq!(config.download_concurrency, 32);
    }

    #[test]
    fn group_url_appends_encoded_group() {
        let config = PeerConfig::default();
        let url = config.group_url("steve@1234").expect("url");
        assert_eq!(url.as_str(), "wss://api.xmcl.app/group/steve%401234");

        let mut local = PeerConfig::default();
        local.relay_url = "ws://127.0.0.1:9000/".into();
        let url = local.group_url("my group").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/group/my%20group");
    }

    #[test]
    fn chunk_floor_rejects_tiny_values() {
        // SAFETY: tests in this module are the only readers of this variable.
        unsafe { std::env::set_var("PEERLINK_CHUNK_BYTES", "16") };
        assert_eq!(PeerConfig::from_env().chunk_bytes, DEFAULT_CHUNK_BYTES);
        unsafe { std::env::set_var("PEERLINK_CHUNK_BYTES", "4096") };
        assert_eq!(PeerConfig::from_env().chunk_bytes, 4096);
        unsafe { std::env::remove_var("PEERLINK_CHUNK_BYTES") };
    }
}
