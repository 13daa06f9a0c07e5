//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use lanchat_core::chunk::DEFAULT_CHUNK_SIZE;
use lanchat_core::config::DEFAULT_ANNOUNCE_INTERVAL_MS;
use lanchat_core::{ConfigError, CoreConfig, Millis};

/// Daemon configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_DISCOVERY_PORT, LANCHAT_TRANSPORT_PORT, LANCHAT_MULTICAST_GROUP,
/// LANCHAT_DOWNLOAD_DIR, LANCHAT_ANNOUNCE_INTERVAL_MS, LANCHAT_CHUNK_SIZE, LANCHAT_ADVERTISE_IP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45681). 0 picks a free port.
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Multicast group for announcements (default 239.255.60.61).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Address peers should connect to. Detected from the default route when unset.
    #[serde(default)]
    pub advertise_ip: Option<Ipv4Addr>,
    /// Run UDP discovery. When off, peers are reached by explicit address only.
    #[serde(default = "default_true")]
    pub discovery: bool,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: Millis,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Where incoming files land (default ~/Downloads/LanChat).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_true() -> bool {
    true
}
fn default_announce_interval_ms() -> Millis {
    DEFAULT_ANNOUNCE_INTERVAL_MS
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("Downloads").join("LanChat"),
        None => std::env::temp_dir().join("lanchat"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            multicast_group: default_multicast_group(),
            advertise_ip: None,
            discovery: default_true(),
            announce_interval_ms: default_announce_interval_ms(),
            chunk_size: default_chunk_size(),
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    /// Protocol tunables for the core, validated.
    pub fn core_config(&self) -> Result<CoreConfig, ConfigError> {
        let core = CoreConfig {
            chunk_size: self.chunk_size,
            ..CoreConfig::with_announce_interval(self.announce_interval_ms)
        };
        core.validate()?;
        Ok(core)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("LANCHAT_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("LANCHAT_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(g) = var("LANCHAT_MULTICAST_GROUP").and_then(|s| s.parse().ok()) {
        c.multicast_group = g;
    }
    if let Some(ip) = var("LANCHAT_ADVERTISE_IP").and_then(|s| s.parse().ok()) {
        c.advertise_ip = Some(ip);
    }
    if let Some(dir) = var("LANCHAT_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
        c.download_dir = PathBuf::from(dir);
    }
    if let Some(ms) = var("LANCHAT_ANNOUNCE_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.announce_interval_ms = ms;
    }
    if let Some(n) = var("LANCHAT_CHUNK_SIZE").and_then(|s| s.parse().ok()) {
        c.chunk_size = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "Ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "Cannot read config file"),
            }
            break;
        }
    }
    None
}
