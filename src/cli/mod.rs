//! Command-line interface module

use crate::types::{OutputFormat, TransportKind};
use clap::Parser;
use std::path::PathBuf;

/// Pairwise Latency Tester - measures point-to-point latency between every pair of ranks
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "plt")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Repetitions of the full stage sequence
    #[arg(short = 'c', long)]
    pub cycles: Option<usize>,

    /// Stages per cycle (default: next power of two of the rank count)
    #[arg(short = 's', long)]
    pub stages: Option<usize>,

    /// Timed exchanges per pairing
    #[arg(short = 'n', long)]
    pub messages: Option<usize>,

    /// Untimed exchanges before each pairing
    #[arg(short = 'w', long)]
    pub warmup: Option<usize>,

    /// Exchange buffer size in bytes
    #[arg(long)]
    pub message_size: Option<usize>,

    /// Transport backend: two-sided, symmetric, rdma, tcp
    #[arg(short = 't', long)]
    pub transport: Option<TransportKind>,

    /// Ranks to run in this process (in-process transports)
    #[arg(short = 'r', long)]
    pub ranks: Option<usize>,

    /// Comma-separated node id per rank, e.g. 0,0,1,1
    #[arg(long, conflicts_with = "ranks_per_node")]
    pub node_ids: Option<String>,

    /// Consecutive ranks sharing a node
    #[arg(long)]
    pub ranks_per_node: Option<usize>,

    /// Rank of this process (tcp)
    #[arg(long)]
    pub rank: Option<usize>,

    /// Comma-separated host:port of every rank, indexed by rank (tcp)
    #[arg(long)]
    pub peers: Option<String>,

    /// Deadline of a single rendezvous, barrier or completion wait in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Polls per wait before giving up, 0 for no limit
    #[arg(long)]
    pub max_polls: Option<u64>,

    /// Histogram bins per decade of latency
    #[arg(long)]
    pub bins_per_decade: Option<u32>,

    /// Report format: text or json
    #[arg(short = 'f', long)]
    pub format: Option<OutputFormat>,

    /// Write the report to a file instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Print the rank to node mapping before measuring
    #[arg(long)]
    pub show_mapping: bool,

    /// Force colored output
    #[arg(long)]
    pub color: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Enable verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,

    /// Describe the supported environment variables and exit
    #[arg(long)]
    pub env_help: bool,
}

impl Cli {
    /// Validate CLI arguments for conflicts and requirements
    pub fn validate(&self) -> Result<(), String> {
        if self.color && self.no_color {
            return Err("Cannot specify both --color and --no-color".to_string());
        }

        let tcp = self.transport == Some(TransportKind::Tcp);
        if tcp && self.ranks.is_some() {
            return Err("--ranks applies to in-process transports; tcp takes its ranks from --peers".to_string());
        }

        if !tcp && self.transport.is_some() && (self.rank.is_some() || self.peers.is_some()) {
            return Err("--rank and --peers require --transport tcp".to_string());
        }

        if self.messages == Some(0) {
            return Err("--messages must be greater than 0".to_string());
        }

        if self.poll_timeout_ms == Some(0) {
            return Err("--poll-timeout-ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Check if colors should be enabled
    pub fn use_colors(&self) -> bool {
        if self.color {
            true
        } else if self.no_color {
            false
        } else {
            supports_color()
        }
    }

    /// Get configuration summary for display
    pub fn get_config_summary(&self) -> String {
        let mut summary = String::new();

        summary.push_str("Command-line Overrides:\n");
        if let Some(transport) = self.transport {
            summary.push_str(&format!("  Transport: {}\n", transport));
        }
        if let Some(ranks) = self.ranks {
            summary.push_str(&format!("  Ranks: {}\n", ranks));
        }
        if let Some(cycles) = self.cycles {
            summary.push_str(&format!("  Cycles: {}\n", cycles));
        }
        if let Some(stages) = self.stages {
            summary.push_str(&format!("  Stages: {}\n", stages));
        }
        if let Some(messages) = self.messages {
            summary.push_str(&format!("  Messages: {}\n", messages));
        }
        if let Some(ref node_ids) = self.node_ids {
            summary.push_str(&format!("  Node ids: {}\n", node_ids));
        }
        if let Some(ref peers) = self.peers {
            summary.push_str(&format!("  Peers: {}\n", peers));
        }
        summary.push_str(&format!("  Colored output: {}\n", self.use_colors()));
        summary.push_str(&format!("  Verbose mode: {}\n", self.verbose));
        summary.push_str(&format!("  Debug mode: {}\n", self.debug));

        summary
    }
}

/// Check if the current terminal supports colors
pub fn supports_color() -> bool {
    if std::env::var("TERM").map(|t| t == "dumb").unwrap_or(false) {
        return false;
    }

    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    if std::env::var("FORCE_COLOR").is_ok() {
        return true;
    }

    #[cfg(unix)]
    {
        true
    }

    #[cfg(not(unix))]
    {
        false
    }
}
