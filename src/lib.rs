//! Pairwise Latency Tester
//!
//! A point-to-point latency harness for HPC clusters. Ranks are paired by an
//! XOR schedule, each pairing runs a timed exchange kernel over one of several
//! transports, and the one-sided and pairwise latencies are collected into
//! nine log-binned histograms split by on-node and off-node locality.

pub mod app;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod histogram;
pub mod logging;
pub mod models;
pub mod output;
pub mod schedule;
pub mod timer;
pub mod topology;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use cluster::{LocalCluster, RunPlan, TcpRank};
pub use engine::{measure_pairing, Engine};
pub use error::{AppError, Result, RetryPolicy};
pub use histogram::{Aggregator, BinLayout, HistogramSet, LatencyVariable};
pub use models::{ClusterReport, Config, RankReport, TestConfig};
pub use output::{JsonFormatter, OutputCoordinator, OutputFormatter, OutputFormatterFactory, TextFormatter};
pub use schedule::StageScheduler;
pub use timer::{Clock, StepClock};
pub use topology::RankTopology;
pub use transport::{LocalFabric, Transport};
pub use types::{Locality, NodeId, OutputFormat, TransportKind};

/// Application version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_CYCLES: usize = 1;
    pub const DEFAULT_MESSAGES: usize = 1000;
    pub const DEFAULT_WARMUP: usize = 10;
    pub const DEFAULT_MESSAGE_SIZE: usize = 8;
    pub const DEFAULT_RANKS: usize = 4;
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_ENABLE_COLOR: bool = true;
}
