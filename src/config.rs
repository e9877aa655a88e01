use crate::auth::Credentials;
use crate::signaller::IceServer;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Tunables of a [`crate::Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// how long offers and candidates received before joining are kept
    #[serde(default = "default_pending_staleness_ms")]
    pub pending_staleness_ms: u64,

    #[serde(default = "default_ice_retry_limit")]
    pub ice_retry_limit: u32,

    #[serde(default = "default_ice_retry_base_ms")]
    pub ice_retry_base_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,

    #[serde(default = "default_file_low_water_mark")]
    pub file_low_water_mark: usize,

    /// replaces the servers announced by the SFU when not empty
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_staleness_ms: default_pending_staleness_ms(),
            ice_retry_limit: default_ice_retry_limit(),
            ice_retry_base_ms: default_ice_retry_base_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            file_chunk_size: default_file_chunk_size(),
            file_low_water_mark: default_file_low_water_mark(),
            ice_servers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn pending_staleness(&self) -> Duration {
        Duration::from_millis(self.pending_staleness_ms)
    }

    pub fn ice_retry_base(&self) -> Duration {
        Duration::from_millis(self.ice_retry_base_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

pub fn load(path: &Path) -> Result<Config> {
    // create a new file if it does not exist
    if !path.exists() {
        let mut file = File::create(path)?;
        let config = toml::from_str::<Config>("")?;
        info!("config {:#?}", config);
        file.write_all(toml::to_string(&config)?.as_ref())?;
        return Ok(config);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(toml::from_str(&contents)?)
}

fn default_server() -> String {
    "ws://localhost:8443/ws".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_pending_staleness_ms() -> u64 {
    4000
}

fn default_ice_retry_limit() -> u32 {
    3
}

fn default_ice_retry_base_ms() -> u64 {
    500
}

fn default_reconnect_delay_ms() -> u64 {
    200
}

fn default_file_chunk_size() -> usize {
    16 * 1024
}

fn default_file_low_water_mark() -> usize {
    64 * 1024
}
