//! Data models and structures for the pairwise latency tester

pub mod config;
pub mod report;

// Re-export main model types
pub use config::{Config, TestConfig, MAX_MESSAGE_SIZE};
pub use report::{ClusterReport, RankReport};
