//! Server configuration.
//!
//! Loaded from a JSON file over compiled defaults; the file is the
//! source of truth for admin credentials, the data root, and the
//! lockout policy. Missing file means defaults (useful for tests).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Top-level server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Root of all durable state (`studies/`, `server.json`).
    pub data_root: PathBuf,
    /// Optional directory of static experiment assets.
    pub assets_dir: Option<PathBuf>,
    /// Admin user → password.
    pub users: BTreeMap<String, String>,
    /// Failed attempts before a login lockout; `None` disables lockout.
    pub lockout_attempts: Option<u32>,
    /// Lockout cooldown, minutes.
    pub lockout_minutes: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            data_root: PathBuf::from("./data"),
            assets_dir: None,
            users: BTreeMap::new(),
            lockout_attempts: Some(5),
            lockout_minutes: 10,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path`, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let config: Self = serde_json::from_str(&raw)?;
                info!(?path, "loaded server configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(?path, "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
