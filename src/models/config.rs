//! Configuration data model and validation

use crate::error::RetryPolicy;
use crate::histogram::BinLayout;
use crate::schedule::ceil_pow2;
use crate::topology::{parse_node_ids, RankTopology};
use crate::types::{AppError, NodeId, OutputFormat, Result, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest exchange buffer accepted, in bytes
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Immutable per-run measurement parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Repetitions of the full stage sequence
    pub num_cycles: usize,
    /// Stages per cycle; stage `s` pairs rank `r` with `r ^ s`
    pub num_stages: usize,
    /// Timed exchanges per pairing
    pub num_messages: usize,
    /// Untimed exchanges before each pairing's timed loop
    pub num_warmup: usize,
    /// Exchange buffer size in bytes
    pub message_size: usize,
}

impl TestConfig {
    /// Check the parameters against the number of ranks in the job
    pub fn validate(&self, num_ranks: usize) -> Result<()> {
        if num_ranks == 0 {
            return Err(AppError::validation("Number of ranks must be greater than 0"));
        }
        if self.num_messages == 0 {
            return Err(AppError::validation("Number of messages must be greater than 0"));
        }
        if self.message_size > MAX_MESSAGE_SIZE {
            return Err(AppError::validation(format!(
                "Message size {} exceeds the {} byte limit",
                self.message_size, MAX_MESSAGE_SIZE
            )));
        }
        let partner_space = ceil_pow2(num_ranks);
        if self.num_stages > partner_space {
            return Err(AppError::validation(format!(
                "{} stages requested but {} ranks only have {} distinct XOR partners",
                self.num_stages, num_ranks, partner_space
            )));
        }
        Ok(())
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_cycles")]
    pub num_cycles: usize,

    /// Stages per cycle, defaults to the XOR partner space of the job
    #[serde(default)]
    pub num_stages: Option<usize>,

    #[serde(default = "default_messages")]
    pub num_messages: usize,

    #[serde(default = "default_warmup")]
    pub num_warmup: usize,

    #[serde(default = "default_message_size")]
    pub message_size: usize,

    #[serde(default)]
    pub transport: TransportKind,

    /// Ranks to launch in this process (in-process transports)
    #[serde(default = "default_ranks")]
    pub ranks: usize,

    /// Explicit node id per rank
    #[serde(default)]
    pub node_ids: Option<Vec<NodeId>>,

    /// Consecutive ranks sharing a node
    #[serde(default)]
    pub ranks_per_node: Option<usize>,

    /// This process's rank (tcp)
    #[serde(default)]
    pub rank: Option<usize>,

    /// `host:port` of every rank, indexed by rank (tcp)
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on polls per wait, 0 for no limit
    #[serde(default)]
    pub max_polls: u64,

    #[serde(default = "default_bins_per_decade")]
    pub bins_per_decade: u32,

    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default)]
    pub output: Option<PathBuf>,

    #[serde(default)]
    pub show_mapping: bool,

    #[serde(default = "default_enable_color")]
    pub enable_color: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cycles: default_cycles(),
            num_stages: None,
            num_messages: default_messages(),
            num_warmup: default_warmup(),
            message_size: default_message_size(),
            transport: TransportKind::default(),
            ranks: default_ranks(),
            node_ids: None,
            ranks_per_node: None,
            rank: None,
            peers: Vec::new(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_polls: 0,
            bins_per_decade: default_bins_per_decade(),
            format: OutputFormat::default(),
            output: None,
            show_mapping: false,
            enable_color: default_enable_color(),
            verbose: false,
            debug: false,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ranks in the whole job
    pub fn world_size(&self) -> usize {
        match self.transport {
            TransportKind::Tcp => self.peers.len(),
            _ => self.ranks,
        }
    }

    /// Resolved measurement parameters
    pub fn test_config(&self) -> TestConfig {
        TestConfig {
            num_cycles: self.num_cycles,
            num_stages: self
                .num_stages
                .unwrap_or_else(|| ceil_pow2(self.world_size())),
            num_messages: self.num_messages,
            num_warmup: self.num_warmup,
            message_size: self.message_size,
        }
    }

    /// Polling limits for rendezvous, barrier and completion waits
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(self.poll_timeout_ms, self.max_polls)
    }

    pub fn bin_layout(&self) -> Result<BinLayout> {
        BinLayout::with_bins_per_decade(self.bins_per_decade)
    }

    /// Topology given by `node_ids` or `ranks_per_node`, `None` if neither is set
    pub fn explicit_topology(&self) -> Result<Option<RankTopology>> {
        let world = self.world_size();
        if let Some(ids) = &self.node_ids {
            return RankTopology::from_node_ids(ids.clone()).map(Some);
        }
        if let Some(per_node) = self.ranks_per_node {
            return RankTopology::blocked(world, per_node).map(Some);
        }
        Ok(None)
    }

    /// Validate the configuration and return any errors
    pub fn validate(&self) -> Result<()> {
        let world = self.world_size();

        if self.transport == TransportKind::Tcp {
            if self.peers.is_empty() {
                return Err(AppError::config("The tcp transport needs --peers with one host:port per rank"));
            }
            match self.rank {
                None => return Err(AppError::config("The tcp transport needs --rank")),
                Some(rank) if rank >= world => {
                    return Err(AppError::config(format!(
                        "Rank {} is out of range for {} peers",
                        rank, world
                    )))
                }
                Some(_) => {}
            }
        }

        if world == 0 {
            return Err(AppError::config("Number of ranks must be greater than 0"));
        }

        if let Some(ids) = &self.node_ids {
            if ids.len() != world {
                return Err(AppError::config(format!(
                    "{} node ids given for {} ranks",
                    ids.len(),
                    world
                )));
            }
        }

        if self.ranks_per_node == Some(0) {
            return Err(AppError::config("Ranks per node must be greater than 0"));
        }

        if self.poll_timeout_ms == 0 {
            return Err(AppError::config("Poll timeout must be greater than 0"));
        }

        if self.bins_per_decade == 0 {
            return Err(AppError::config("Bins per decade must be greater than 0"));
        }

        self.test_config().validate(world)?;

        Ok(())
    }

    /// Merge environment variables into this configuration
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Some(value) = env_parse("PLT_CYCLES")? {
            self.num_cycles = value;
        }
        if let Some(value) = env_parse("PLT_STAGES")? {
            self.num_stages = Some(value);
        }
        if let Some(value) = env_parse("PLT_MESSAGES")? {
            self.num_messages = value;
        }
        if let Some(value) = env_parse("PLT_WARMUP")? {
            self.num_warmup = value;
        }
        if let Some(value) = env_parse("PLT_MESSAGE_SIZE")? {
            self.message_size = value;
        }
        if let Some(value) = env_parse("PLT_TRANSPORT")? {
            self.transport = value;
        }
        if let Some(value) = env_parse("PLT_RANKS")? {
            self.ranks = value;
        }
        if let Ok(value) = std::env::var("PLT_NODE_IDS") {
            self.node_ids = Some(
                parse_node_ids(&value)
                    .map_err(|e| AppError::config(format!("Invalid PLT_NODE_IDS value '{}': {}", value, e)))?,
            );
        }
        if let Some(value) = env_parse("PLT_RANKS_PER_NODE")? {
            self.ranks_per_node = Some(value);
        }
        if let Some(value) = env_parse("PLT_RANK")? {
            self.rank = Some(value);
        }
        if let Ok(value) = std::env::var("PLT_PEERS") {
            self.peers = split_list(&value);
        }
        if let Some(value) = env_parse("PLT_POLL_TIMEOUT_MS")? {
            self.poll_timeout_ms = value;
        }
        if let Some(value) = env_parse("PLT_MAX_POLLS")? {
            self.max_polls = value;
        }
        if let Some(value) = env_parse("PLT_BINS_PER_DECADE")? {
            self.bins_per_decade = value;
        }
        if let Some(value) = env_parse("PLT_FORMAT")? {
            self.format = value;
        }
        if let Some(value) = env_parse("ENABLE_COLOR")? {
            self.enable_color = value;
        }

        Ok(())
    }
}

/// Parse an environment variable if it is set
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Split a comma separated list, dropping empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// Default value functions for serde
fn default_cycles() -> usize {
    crate::defaults::DEFAULT_CYCLES
}

fn default_messages() -> usize {
    crate::defaults::DEFAULT_MESSAGES
}

fn default_warmup() -> usize {
    crate::defaults::DEFAULT_WARMUP
}

fn default_message_size() -> usize {
    crate::defaults::DEFAULT_MESSAGE_SIZE
}

fn default_ranks() -> usize {
    crate::defaults::DEFAULT_RANKS
}

fn default_poll_timeout_ms() -> u64 {
    crate::defaults::DEFAULT_POLL_TIMEOUT.as_millis() as u64
}

fn default_bins_per_decade() -> u32 {
    crate::histogram::DEFAULT_BINS_PER_DECADE
}

fn default_enable_color() -> bool {
    crate::defaults::DEFAULT_ENABLE_COLOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.test_config().num_stages, ceil_pow2(config.ranks));
    }

    #[test]
    fn test_stage_default_covers_partner_space() {
        let config = Config {
            ranks: 6,
            ..Default::default()
        };
        assert_eq!(config.test_config().num_stages, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stages_beyond_partner_space_invalid() {
        let config = Config {
            ranks: 4,
            num_stages: Some(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ranks: 3,
            num_stages: Some(4),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_invalid() {
        let config = Config {
            ranks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            num_messages: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            poll_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_message_size_limit() {
        let config = Config {
            message_size: MAX_MESSAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            message_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_id_length_mismatch() {
        let config = Config {
            ranks: 4,
            node_ids: Some(vec![0, 0, 1]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tcp_requires_peers_and_rank() {
        let mut config = Config {
            transport: TransportKind::Tcp,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.peers = vec!["127.0.0.1:7000".to_string(), "127.0.0.1:7001".to_string()];
        assert!(config.validate().is_err());

        config.rank = Some(2);
        assert!(config.validate().is_err());

        config.rank = Some(1);
        assert!(config.validate().is_ok());
        assert_eq!(config.world_size(), 2);
    }

    #[test]
    fn test_explicit_topology() {
        let config = Config {
            ranks: 4,
            ranks_per_node: Some(2),
            ..Default::default()
        };
        let topology = config.explicit_topology().unwrap().unwrap();
        assert_eq!(topology.node_ids(), &[0, 0, 1, 1]);

        assert!(Config::default().explicit_topology().unwrap().is_none());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = Config {
            poll_timeout_ms: 1500,
            max_polls: 7,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_polls, Some(7));
        assert_eq!(policy.deadline, Some(std::time::Duration::from_millis(1500)));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a:1, b:2,,"), vec!["a:1".to_string(), "b:2".to_string()]);
    }
}
