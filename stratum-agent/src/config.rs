//! Agent configuration.
//!
//! Configuration comes from a JSON file or from environment variables:
//!
//! - `AGENT_CONFIG`: path to a JSON config file (other variables are then
//!   ignored)
//! - `AGENT_POOLS`: comma-separated pool list, `host:port` with an optional
//!   `stratum+tcp://` or `tcp://` scheme
//! - `AGENT_SUBMIT_RESPONSE_FROM_SERVER`: `1`/`true` to ask pools to answer
//!   submits themselves
//! - `AGENT_DIAL_TIMEOUT_SECS`, `AGENT_HANDSHAKE_TIMEOUT_SECS`: timeouts

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid pool address: {0}")]
    InvalidPool(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("No pools configured")]
    NoPools,

    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// One pool endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PoolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PoolAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let addr = trimmed
            .strip_prefix("stratum+tcp://")
            .or_else(|| trimmed.strip_prefix("tcp://"))
            .unwrap_or(trimmed);

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidPool(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidPool(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| ConfigError::InvalidPool(s.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Agent-wide settings shared by every upstream session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Pool endpoints, selected by index
    pub pools: Vec<PoolAddress>,

    /// Ask the pool to send submit responses back to the agent
    pub submit_response_from_server: bool,

    /// Upper bound on dialing a pool
    #[serde(rename = "dial_timeout_secs", deserialize_with = "seconds")]
    pub dial_timeout: Duration,

    /// Upper bound on the whole subscribe/authorize exchange
    #[serde(rename = "handshake_timeout_secs", deserialize_with = "seconds")]
    pub handshake_timeout: Duration,

    /// Capacity of each upstream session's event channel
    pub event_channel_capacity: usize,

    /// Identity sent in `mining.subscribe`
    pub user_agent: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            submit_response_from_server: false,
            dial_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(30),
            event_channel_capacity: 256,
            user_agent: concat!("stratum-agent/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl AgentConfig {
    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("AGENT_CONFIG") {
            return Self::from_json(&std::fs::read_to_string(path)?);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `AGENT_*` variables supplied by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(pools) = lookup("AGENT_POOLS") {
            config.pools = pools
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(str::parse::<PoolAddress>)
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = lookup("AGENT_SUBMIT_RESPONSE_FROM_SERVER") {
            config.submit_response_from_server = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "AGENT_SUBMIT_RESPONSE_FROM_SERVER",
                        value,
                    });
                }
            };
        }

        if let Some(value) = lookup("AGENT_DIAL_TIMEOUT_SECS") {
            config.dial_timeout = parse_secs("AGENT_DIAL_TIMEOUT_SECS", value)?;
        }

        if let Some(value) = lookup("AGENT_HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout = parse_secs("AGENT_HANDSHAKE_TIMEOUT_SECS", value)?;
        }

        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        Ok(self)
    }
}

fn parse_secs(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidValue { key, value })
}
