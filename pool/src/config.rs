use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::algorithm::Algorithm;
pub use crate::vardiff::VarDiffConfig;

/// Starting difficulty for ports that do not configure one.
pub const DEFAULT_PORT_DIFFICULTY: f64 = 8.0;

const DEFAULT_CONFIG_PATH: &str = "pool_config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for `PoolConfig`.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("No daemons configured")]
    NoDaemons,

    #[error("No stratum ports configured")]
    NoPorts,

    #[error("Pool address is empty")]
    MissingAddress,

    #[error("Invalid vardiff on port {port}: {reason}")]
    InvalidVarDiff { port: u16, reason: String },

    #[error("Invalid difficulty {diff} on port {port}")]
    InvalidDifficulty { port: u16, diff: f64 },

    #[error("Reward recipients take {0}% of the block reward")]
    InvalidRecipients(f64),

    #[error("extranonce_bytes must be between 1 and 4, got {0}")]
    InvalidExtraNonce(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinConfig {
    pub name: String,
    pub symbol: String,
    pub algorithm: String,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            name: "Ravencoin".to_string(),
            symbol: "RVN".to_string(),
            algorithm: "kawpow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Starting difficulty; `DEFAULT_PORT_DIFFICULTY` when absent.
    #[serde(default)]
    pub diff: Option<f64>,
    #[serde(default)]
    pub var_diff: Option<VarDiffConfig>,
}

impl PortConfig {
    pub fn initial_difficulty(&self) -> f64 {
        self.diff.unwrap_or(DEFAULT_PORT_DIFFICULTY)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ban duration in seconds.
    #[serde(default = "default_ban_time")]
    pub time: u64,
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f64,
    /// Shares to observe before judging a client.
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: default_ban_time(),
            invalid_percent: default_invalid_percent(),
            check_threshold: default_check_threshold(),
            purge_interval: default_purge_interval(),
        }
    }
}

fn default_true() -> bool { true }
fn default_ban_time() -> u64 { 600 }
fn default_invalid_percent() -> f64 { 50.0 }
fn default_check_threshold() -> u64 { 500 }
fn default_purge_interval() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub coin: CoinConfig,
    /// Pool payout address; block rewards go to its script.
    pub address: String,
    /// Address -> percent of the block reward.
    #[serde(default)]
    pub reward_recipients: HashMap<String, f64>,
    pub daemons: Vec<DaemonConfig>,
    pub ports: BTreeMap<u16, PortConfig>,
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Seconds of read inactivity before a client is dropped.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Seconds without a broadcast before the current job is re-sent.
    #[serde(default = "default_job_rebroadcast_timeout")]
    pub job_rebroadcast_timeout: u64,
    /// Template polling interval in milliseconds, 0 disables polling.
    #[serde(default = "default_block_refresh_interval")]
    pub block_refresh_interval: u64,
    #[serde(default)]
    pub tcp_proxy_protocol: bool,
    #[serde(default = "default_extranonce_bytes")]
    pub extranonce_bytes: usize,
    #[serde(default = "default_coinbase_tag")]
    pub coinbase_tag: String,
    /// Daemon RPC timeout in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: u64,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Interval between sync checks while the daemon downloads blocks (ms).
    #[serde(default = "default_sync_poll_interval")]
    pub sync_poll_interval: u64,
    /// Instance 0 is the primary and prints the full startup banner.
    #[serde(default)]
    pub instance_id: u32,
    #[serde(default)]
    pub emit_invalid_block_hashes: bool,
}

fn default_listen_host() -> String { "0.0.0.0".to_string() }
fn default_connection_timeout() -> u64 { 600 }
fn default_job_rebroadcast_timeout() -> u64 { 55 }
fn default_block_refresh_interval() -> u64 { 1000 }
fn default_extranonce_bytes() -> usize { 2 }
fn default_coinbase_tag() -> String { "kawpow".to_string() }
fn default_rpc_timeout() -> u64 { 5000 }
fn default_max_line_bytes() -> usize { 10240 }
fn default_sync_poll_interval() -> u64 { 5000 }

impl PoolConfig {
    /// Loads `pool_config.json` (or `$POOL_CONFIG`), applies env overrides
    /// and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("POOL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_path(path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&txt)
    }

    pub fn from_json(txt: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(txt)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("POOL_INSTANCE_ID") {
            self.instance_id = id.parse().unwrap_or(self.instance_id);
        }
        if let Ok(host) = std::env::var("POOL_LISTEN_HOST") {
            self.listen_host = host;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Algorithm::from_name(&self.coin.algorithm)?;
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if self.daemons.is_empty() {
            return Err(ConfigError::NoDaemons);
        }
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        for (&port, port_cfg) in &self.ports {
            let diff = port_cfg.initial_difficulty();
            if !(diff > 0.0) || !diff.is_finite() {
                return Err(ConfigError::InvalidDifficulty { port, diff });
            }
            if let Some(vd) = &port_cfg.var_diff {
                vd.validate()
                    .map_err(|reason| ConfigError::InvalidVarDiff { port, reason })?;
            }
        }
        let total: f64 = self.reward_recipients.values().sum();
        if total >= 100.0 || self.reward_recipients.values().any(|p| *p < 0.0) {
            return Err(ConfigError::InvalidRecipients(total));
        }
        if !(1..=4).contains(&self.extranonce_bytes) {
            return Err(ConfigError::InvalidExtraNonce(self.extranonce_bytes));
        }
        Ok(())
    }

    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        Algorithm::from_name(&self.coin.algorithm)
    }

    pub fn is_primary(&self) -> bool {
        self.instance_id == 0
    }
}
