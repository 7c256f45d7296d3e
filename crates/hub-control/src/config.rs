//! Configuration for the control server.
//!
//! Defaults can be overridden through environment variables:
//!
//! - `HUB_CONTROL_BIND_ADDR` (default: "0.0.0.0")
//! - `HUB_CONTROL_PORT`      (default: "8080")
//! - `HUB_SHARD_COUNT`       (default: "1")
//! - `HUB_RECONNECT_SECS`    (default: "10")
//! - `HUB_MANAGER_AUTH`      (optional shared secret sent to workers)
//! - `HUB_ROSTER_FILE`       (optional JSON array of user records)

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// Control server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// HTTP port of the control API.
    pub port: u16,

    /// Number of shards users are spread over.
    pub shard_count: u32,

    /// Delay before reconnecting a severed control channel.
    pub reconnect_delay: Duration,

    /// Token sent in the `auth` frame to every worker.
    pub manager_auth: Option<String>,

    /// Roster pushed to workers when they register.
    pub roster_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            shard_count: 1,
            reconnect_delay: Duration::from_secs(10),
            manager_auth: None,
            roster_file: None,
        }
    }
}

impl Config {
    /// Construct a `Config` from environment variables, falling back
    /// to the defaults above.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_addr = env::var("HUB_CONTROL_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let port = read_env_or_default("HUB_CONTROL_PORT", defaults.port)?;
        let shard_count = read_env_or_default("HUB_SHARD_COUNT", defaults.shard_count)?;
        let reconnect_secs = read_env_or_default("HUB_RECONNECT_SECS", 10u64)?;
        let manager_auth = env::var("HUB_MANAGER_AUTH").ok().filter(|s| !s.is_empty());
        let roster_file = env::var("HUB_ROSTER_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        if shard_count == 0 {
            anyhow::bail!("HUB_SHARD_COUNT must be at least 1");
        }

        Ok(Config {
            bind_addr,
            port,
            shard_count,
            reconnect_delay: Duration::from_secs(reconnect_secs),
            manager_auth,
            roster_file,
        })
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn read_env_or_default<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {val:?}")),
        Err(_) => Ok(default),
    }
}
