//! Load node config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Node configuration. File: ~/.config/gofile/p2p.toml or /etc/gofile/p2p.toml.
/// Env overrides: GOFILE_ENABLE_P2P, GOFILE_P2P_LISTEN, GOFILE_P2P_TRACKER, GOFILE_P2P_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Master switch; the server is not started unless set.
    #[serde(default)]
    pub enable_p2p: bool,
    /// Transfer listen address (default 0.0.0.0:45679).
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Tracker node to join, as host:port.
    #[serde(default)]
    pub tracker: Option<String>,
    /// Store root (default ./data).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub transfer: share_core::Config,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 45679))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enable_p2p: false,
            listen: default_listen(),
            tracker: None,
            data_dir: default_data_dir(),
            transfer: share_core::Config::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: defaults, then the first config file found (if any), then env vars.
/// A broken file in a default location is skipped.
pub fn load() -> NodeConfig {
    let mut c = load_default_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Load config from an explicit path, then env vars. Errors are reported.
pub fn load_from(path: &Path) -> Result<NodeConfig, ConfigError> {
    let mut c = read_file(path)?;
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

/// Apply environment overrides. Values that do not parse are ignored.
pub fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("GOFILE_ENABLE_P2P") {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => c.enable_p2p = true,
            "0" | "false" | "no" | "off" => c.enable_p2p = false,
            _ => {}
        }
    }
    if let Some(s) = var("GOFILE_P2P_LISTEN") {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            c.listen = addr;
        }
    }
    if let Some(s) = var("GOFILE_P2P_TRACKER") {
        c.tracker = if s.is_empty() { None } else { Some(s) };
    }
    if let Some(s) = var("GOFILE_P2P_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = PathBuf::from(s);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/gofile/p2p.toml"));
    }
    out.push(PathBuf::from("/etc/gofile/p2p.toml"));
    out
}

fn read_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_default_file() -> Option<NodeConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file");
            None
        }
    }
}
