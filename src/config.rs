//! Pool configuration model
//!
//! TOML-backed serde structures for everything the engine consumes: listening
//! ports with optional vardiff, the banning policy, daemon instances and the
//! coin description. Loading and validation live here; the binary wires the
//! file path in via clap.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Reward scheme of the coin, which changes coinbase construction and block
/// serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardKind {
    /// Proof of work
    #[serde(rename = "POW")]
    Pow,
    /// Proof of stake: timestamped coinbase, trailing signature byte
    #[serde(rename = "POS")]
    Pos,
}

/// Coin description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinConfig {
    /// Display name
    pub name: String,
    /// Ticker symbol
    pub symbol: String,
    /// Hash algorithm registry name
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Reward scheme
    pub reward: RewardKind,
    /// Whether generation transactions carry a comment string (tx version 2)
    #[serde(default)]
    pub tx_messages: bool,
}

/// One listening port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Starting share difficulty for connections on this port
    #[serde(default = "default_port_diff")]
    pub diff: f64,
    /// Adaptive difficulty controller settings; absent disables vardiff
    #[serde(default)]
    pub var_diff: Option<VarDiffConfig>,
    /// Terminate TLS on this port
    #[serde(default)]
    pub tls: bool,
}

/// Adaptive difficulty controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDiffConfig {
    /// Lowest difficulty the controller may assign
    pub min_diff: f64,
    /// Highest difficulty the controller may assign
    pub max_diff: f64,
    /// Desired seconds between submissions
    pub target_time: u64,
    /// Seconds between retarget evaluations
    pub retarget_time: u64,
    /// Acceptable percent deviation from `target_time` before retargeting
    pub variance_percent: f64,
    /// Only double or halve instead of scaling by the measured ratio
    #[serde(default)]
    pub x2mode: bool,
}

/// Share-quality banning policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanningConfig {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,
    /// Ban duration in seconds
    #[serde(default = "default_ban_time")]
    pub time: u64,
    /// Invalid-share percentage that triggers a ban
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f64,
    /// Number of shares before the percentage is checked
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u64,
    /// Seconds between sweeps of the ban table
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,
}

/// TLS key material for TLS-flagged ports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path
    pub cert: String,
    /// PEM private key path
    pub key: String,
}

/// One blockchain daemon instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// RPC hostname
    #[serde(default = "default_daemon_host")]
    pub host: String,
    /// RPC port
    pub port: u16,
    /// RPC username
    pub user: String,
    /// RPC password
    pub password: String,
}

/// Reward-split recipient resolved to an output script
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Fraction of the remaining reward (0.0 - 1.0)
    pub percent: f64,
    /// Output script
    pub script: Vec<u8>,
}

/// Top-level pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Coin description
    pub coin: CoinConfig,
    /// Pool payout address
    pub address: String,
    /// Fee recipients: address (or 40-hex mining key) to percent of reward
    #[serde(default)]
    pub reward_recipients: HashMap<String, f64>,
    /// Listening ports
    #[serde(deserialize_with = "de_ports")]
    pub ports: HashMap<u16, PortConfig>,
    /// Daemon instances, first entry is the batch target
    pub daemons: Vec<DaemonConfig>,
    /// Banning policy
    #[serde(default)]
    pub banning: Option<BanningConfig>,
    /// TLS key material, required when any port sets `tls`
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Seconds of inactivity before a connection is dropped at job broadcast
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Seconds without a broadcast before work is refreshed and rebroadcast
    #[serde(default = "default_rebroadcast_timeout")]
    pub job_rebroadcast_timeout: u64,
    /// Expect a PROXY protocol line as the first read on each connection
    #[serde(default)]
    pub tcp_proxy_protocol: bool,
    /// Milliseconds between template polls; 0 disables polling
    #[serde(default = "default_block_refresh_interval")]
    pub block_refresh_interval: u64,
}

// TOML table keys are always strings; parse them into port numbers
fn de_ports<'de, D>(deserializer: D) -> std::result::Result<HashMap<u16, PortConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = HashMap::<String, PortConfig>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(port, cfg)| {
            port.parse::<u16>()
                .map(|port| (port, cfg))
                .map_err(|_| serde::de::Error::custom(format!("invalid port number: {}", port)))
        })
        .collect()
}

fn default_algorithm() -> String {
    "sha256d".to_string()
}

fn default_port_diff() -> f64 {
    8.0
}

fn default_ban_time() -> u64 {
    600
}

fn default_invalid_percent() -> f64 {
    50.0
}

fn default_check_threshold() -> u64 {
    500
}

fn default_purge_interval() -> u64 {
    300
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connection_timeout() -> u64 {
    600
}

fn default_rebroadcast_timeout() -> u64 {
    55
}

fn default_block_refresh_interval() -> u64 {
    1000
}

impl PoolConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::config("at least one stratum port is required"));
        }
        if self.daemons.is_empty() {
            return Err(Error::config("at least one daemon is required"));
        }
        if crate::algo::from_name(&self.coin.algorithm).is_none() {
            return Err(Error::config(format!(
                "unknown hash algorithm: {}",
                self.coin.algorithm
            )));
        }
        let fee_total: f64 = self.reward_recipients.values().sum();
        if fee_total > 100.0 {
            return Err(Error::config(format!(
                "reward recipients total {}% exceeds 100%",
                fee_total
            )));
        }
        if self.ports.values().any(|p| p.tls) && self.tls.is_none() {
            return Err(Error::config(
                "a port requests TLS but no [tls] cert/key is configured",
            ));
        }
        for (port, cfg) in &self.ports {
            if let Some(vd) = &cfg.var_diff {
                if vd.min_diff <= 0.0 || vd.max_diff < vd.min_diff {
                    return Err(Error::config(format!(
                        "invalid vardiff difficulty bounds on port {}",
                        port
                    )));
                }
                if vd.target_time == 0 || vd.retarget_time == 0 {
                    return Err(Error::config(format!(
                        "vardiff times must be non-zero on port {}",
                        port
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the fee recipients into output scripts. Entries that fail to
    /// decode are skipped with a warning, matching lenient pool behavior.
    pub fn resolve_recipients(&self) -> Vec<Recipient> {
        let mut recipients = Vec::new();
        for (addr, percent) in &self.reward_recipients {
            let script = if addr.len() == 40 {
                crate::util::mining_key_to_script(addr)
            } else {
                crate::util::address_to_script(addr)
            };
            match script {
                Ok(script) => recipients.push(Recipient {
                    percent: percent / 100.0,
                    script,
                }),
                Err(e) => {
                    tracing::error!("failed to build output script for recipient {}: {}", addr, e)
                }
            }
        }
        if recipients.is_empty() {
            tracing::warn!("no reward recipients configured, no pool fee will be taken");
        }
        recipients
    }

    /// Total configured fee percentage
    pub fn fee_percent(&self) -> f64 {
        self.reward_recipients.values().sum()
    }
}
