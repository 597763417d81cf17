//! Configuration validation utilities and rules

use crate::{
    error::Result,
    models::Config,
    schedule::ceil_pow2,
    types::TransportKind,
};
use colored::Colorize;
use std::collections::HashSet;

/// Configuration validator with advisory checks beyond `Config::validate`
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration with comprehensive checks
    pub fn validate_comprehensive(config: &Config) -> Result<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();

        // Hard errors first
        config.validate()?;

        warnings.extend(Self::validate_schedule(config));
        warnings.extend(Self::validate_measurement_settings(config));
        warnings.extend(Self::validate_placement(config));
        warnings.extend(Self::validate_peers(config));

        Ok(warnings)
    }

    /// Rank counts and stage coverage
    fn validate_schedule(config: &Config) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        let world = config.world_size();
        let partner_space = ceil_pow2(world);
        let stages = config.test_config().num_stages;

        if world == 1 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                "A single rank has no partners; only the self-pairing stage is skipped".to_string(),
            ));
        } else if !world.is_power_of_two() {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!(
                    "{} ranks is not a power of two; stages pairing a rank with one of the {} missing ranks are skipped",
                    world,
                    partner_space - world
                ),
            ));
        }

        if stages < partner_space {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!(
                    "{} of {} stages per cycle; some rank pairs will not be measured",
                    stages, partner_space
                ),
            ));
        }

        warnings
    }

    /// Sample counts, warm-up and waiting limits
    fn validate_measurement_settings(config: &Config) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        if config.num_warmup == 0 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                "No warm-up exchanges; the first samples of each pairing include connection setup".to_string(),
            ));
        }

        if config.num_messages < 100 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!(
                    "{} messages per pairing gives coarse minimum latencies (recommended: >= 100)",
                    config.num_messages
                ),
            ));
        }

        if config.poll_timeout_ms < 100 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                format!(
                    "Poll timeout of {}ms may abort slow rendezvous and barriers",
                    config.poll_timeout_ms
                ),
            ));
        }

        warnings
    }

    /// In-process ranks compete for cores
    fn validate_placement(config: &Config) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        if config.transport.is_in_process() {
            let cpus = num_cpus::get();
            if config.ranks > cpus {
                warnings.push(ValidationWarning::new(
                    ValidationLevel::Warning,
                    format!(
                        "{} ranks on {} CPUs; oversubscribed ranks inflate measured latency",
                        config.ranks, cpus
                    ),
                ));
            }
        }

        warnings
    }

    /// Peer addresses of a TCP job
    fn validate_peers(config: &Config) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        if config.transport != TransportKind::Tcp {
            return warnings;
        }

        let mut seen = HashSet::new();
        for (rank, peer) in config.peers.iter().enumerate() {
            if !seen.insert(peer.as_str()) {
                warnings.push(ValidationWarning::new(
                    ValidationLevel::Error,
                    format!("Rank {} reuses address '{}'; every rank needs its own port", rank, peer),
                ));
            }
            if peer.rsplit_once(':').and_then(|(_, port)| port.parse::<u16>().ok()).is_none() {
                warnings.push(ValidationWarning::new(
                    ValidationLevel::Error,
                    format!("Peer '{}' of rank {} is not in host:port form", peer, rank),
                ));
            }
        }

        warnings
    }
}

/// Validation warning levels
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationLevel {
    Info,
    Warning,
    Error,
}

impl ValidationLevel {
    /// Get display string for level
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    /// Get color for terminal display
    pub fn color(&self) -> &'static str {
        match self {
            Self::Info => "blue",
            Self::Warning => "yellow",
            Self::Error => "red",
        }
    }
}

/// Configuration validation warning
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub level: ValidationLevel,
    pub message: String,
}

impl ValidationWarning {
    /// Create a new validation warning
    pub fn new(level: ValidationLevel, message: String) -> Self {
        Self { level, message }
    }

    /// Format warning for display
    pub fn format(&self, use_color: bool) -> String {
        let tag = format!("[{}]", self.level.as_str());
        if use_color {
            format!("{} {}", tag.color(self.level.color()).bold(), self.message)
        } else {
            format!("{} {}", tag, self.message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == ValidationLevel::Error
    }
}

/// Convenience function for comprehensive configuration validation
pub fn validate_config(config: &Config) -> Result<Vec<ValidationWarning>> {
    ConfigValidator::validate_comprehensive(config)
}
