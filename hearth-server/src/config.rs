//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// Echoed to devices at check-in; where they keep talking to us.
    pub transport_url: String,
    pub weather_url: String,
    pub long_poll_timeout_ms: u64,
    pub availability_timeout_ms: u64,
    pub availability_check_interval_ms: u64,
    /// Broker for users whose integration config names none.
    pub default_broker_url: String,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8480".to_string(),
            database_path: PathBuf::from("hearth.db"),
            transport_url: "http://localhost:8480".to_string(),
            weather_url: String::new(),
            long_poll_timeout_ms: 60_000,
            availability_timeout_ms: 300_000,
            availability_check_interval_ms: 30_000,
            default_broker_url: "mqtt://localhost:1883".to_string(),
            max_body_bytes: 1_048_576,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
