//! Front-end configuration.
//!
//! Values come from an optional TOML file, then command-line flags
//! override them:
//!
//! ```toml
//! listen_addr = "0.0.0.0:8000"
//! shards = ["10.0.0.2:8100", "10.0.0.3:8100"]
//! manager_auth = "secret"
//! reconnect_secs = 10
//! ```
//!
//! Shard `i` is reached at `shards[i]`; the shard count is the length of
//! the list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no shards configured")]
    NoShards,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// HTTP / WebSocket listen address.
    pub listen_addr: String,

    /// Worker address of each shard, indexed by shard id.
    pub shards: Vec<String>,

    /// Token sent in the `auth` frame of every worker handshake.
    pub manager_auth: Option<String>,

    /// Delay before reconnecting a lost control channel.
    pub reconnect_secs: u64,

    /// Buffer of the socket-closed broadcast channel.
    pub closed_event_capacity: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            listen_addr: "0.0.0.0:8000".to_string(),
            shards: vec!["127.0.0.1:8100".to_string()],
            manager_auth: None,
            reconnect_secs: 10,
            closed_event_capacity: 256,
        }
    }
}

impl FrontendConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.is_empty() {
            return Err(ConfigError::NoShards);
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(name = "hub-frontend")]
#[clap(about = "Front-end tier of the engine hub")]
pub struct Cli {
    /// TOML configuration file
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address (overrides the file)
    #[clap(short, long)]
    pub listen: Option<String>,

    /// Worker address, once per shard in shard order (overrides the file)
    #[clap(short, long = "shard")]
    pub shards: Vec<String>,

    /// Shared secret for worker handshakes
    #[clap(long)]
    pub auth: Option<String>,

    /// Seconds between reconnect attempts
    #[clap(long)]
    pub reconnect_secs: Option<u64>,
}

impl Cli {
    pub fn into_config(self) -> Result<FrontendConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => FrontendConfig::load(path)?,
            None => FrontendConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if !self.shards.is_empty() {
            config.shards = self.shards;
        }
        if self.auth.is_some() {
            config.manager_auth = self.auth;
        }
        if let Some(secs) = self.reconnect_secs {
            config.reconnect_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}
