//! Configuration parsing from CLI arguments and environment variables

use crate::{
    cli::Cli,
    config::env::EnvManager,
    error::{AppError, Result},
    models::{config::split_list, Config},
    topology::parse_node_ids,
};

/// Configuration parser that combines CLI arguments with environment variables
pub struct ConfigParser {
    cli: Cli,
}

impl ConfigParser {
    /// Create a new configuration parser with CLI arguments
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Parse and build the complete configuration
    pub fn parse(&self) -> Result<Config> {
        let mut config = Config::default();

        EnvManager::load_env_file(self.cli.debug)?;
        config.merge_from_env()?;
        self.apply_cli_overrides(&mut config)?;

        config.validate()?;

        Ok(config)
    }

    /// Apply CLI argument overrides to configuration
    fn apply_cli_overrides(&self, config: &mut Config) -> Result<()> {
        let cli = &self.cli;

        if let Some(cycles) = cli.cycles {
            config.num_cycles = cycles;
        }
        if let Some(stages) = cli.stages {
            config.num_stages = Some(stages);
        }
        if let Some(messages) = cli.messages {
            config.num_messages = messages;
        }
        if let Some(warmup) = cli.warmup {
            config.num_warmup = warmup;
        }
        if let Some(size) = cli.message_size {
            config.message_size = size;
        }
        if let Some(transport) = cli.transport {
            config.transport = transport;
        }
        if let Some(ranks) = cli.ranks {
            config.ranks = ranks;
        }

        // The two ways of describing the mapping replace each other
        if let Some(ref list) = cli.node_ids {
            let ids = parse_node_ids(list)
                .map_err(|e| AppError::config(format!("Invalid --node-ids '{}': {}", list, e)))?;
            config.node_ids = Some(ids);
            config.ranks_per_node = None;
        }
        if let Some(per_node) = cli.ranks_per_node {
            config.ranks_per_node = Some(per_node);
            config.node_ids = None;
        }

        if let Some(rank) = cli.rank {
            config.rank = Some(rank);
        }
        if let Some(ref peers) = cli.peers {
            config.peers = split_list(peers);
        }
        if let Some(timeout) = cli.poll_timeout_ms {
            config.poll_timeout_ms = timeout;
        }
        if let Some(max_polls) = cli.max_polls {
            config.max_polls = max_polls;
        }
        if let Some(bins) = cli.bins_per_decade {
            config.bins_per_decade = bins;
        }
        if let Some(format) = cli.format {
            config.format = format;
        }
        if let Some(ref output) = cli.output {
            config.output = Some(output.clone());
        }

        if cli.color {
            config.enable_color = true;
        }
        if cli.no_color {
            config.enable_color = false;
        }

        // CLI-only flags
        config.show_mapping = cli.show_mapping;
        config.verbose = cli.verbose;
        config.debug = cli.debug;

        if config.debug {
            eprintln!("Applied CLI overrides to configuration");
            eprintln!("{}", display_config_summary(config));
        }

        Ok(())
    }
}

/// Convenience function to load complete configuration from CLI arguments
pub fn load_config(cli: Cli) -> Result<Config> {
    let parser = ConfigParser::new(cli);
    parser.parse()
}

/// Display configuration summary for debug purposes
pub fn display_config_summary(config: &Config) -> String {
    let mut summary = Vec::new();

    summary.push(format!("Transport: {}", config.transport));
    summary.push(format!("Ranks: {}", config.world_size()));
    match (&config.node_ids, config.ranks_per_node) {
        (Some(ids), _) => summary.push(format!(
            "Node ids: {}",
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
        )),
        (None, Some(per_node)) => summary.push(format!("Ranks per node: {}", per_node)),
        (None, None) => summary.push("Node mapping: automatic".to_string()),
    }
    if let Some(rank) = config.rank {
        summary.push(format!("Rank: {}", rank));
    }
    if !config.peers.is_empty() {
        summary.push(format!("Peers: {}", config.peers.join(", ")));
    }

    let test = config.test_config();
    summary.push(format!("Cycles: {}", test.num_cycles));
    summary.push(format!("Stages: {}", test.num_stages));
    summary.push(format!("Messages: {}", test.num_messages));
    summary.push(format!("Warmup: {}", test.num_warmup));
    summary.push(format!("Message Size: {} bytes", test.message_size));
    summary.push(format!("Poll Timeout: {}ms", config.poll_timeout_ms));
    summary.push(format!(
        "Max Polls: {}",
        if config.max_polls == 0 {
            "unlimited".to_string()
        } else {
            config.max_polls.to_string()
        }
    ));
    summary.push(format!("Bins Per Decade: {}", config.bins_per_decade));
    summary.push(format!("Format: {}", config.format));
    summary.push(format!("Color Output: {}", config.enable_color));
    summary.push(format!("Verbose: {}", config.verbose));
    summary.push(format!("Debug: {}", config.debug));

    summary.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_LOCK;
    use crate::types::{OutputFormat, TransportKind};
    use clap::Parser;
    use std::env;

    const VARS: [&str; 8] = [
        "PLT_MESSAGES",
        "PLT_TRANSPORT",
        "PLT_RANKS",
        "PLT_NODE_IDS",
        "PLT_RANKS_PER_NODE",
        "PLT_FORMAT",
        "PLT_STAGES",
        "ENABLE_COLOR",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_without_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let config = ConfigParser::new(Cli::parse_from(["plt"])).parse().unwrap();
        assert_eq!(config.num_messages, crate::defaults::DEFAULT_MESSAGES);
        assert_eq!(config.ranks, crate::defaults::DEFAULT_RANKS);
        assert_eq!(config.transport, TransportKind::TwoSided);
        assert!(config.node_ids.is_none());
    }

    #[test]
    fn test_cli_overrides_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("PLT_MESSAGES", "50");
        env::set_var("PLT_TRANSPORT", "symmetric");
        env::set_var("PLT_FORMAT", "json");

        let cli = Cli::parse_from(["plt", "-n", "75", "-r", "2"]);
        let config = ConfigParser::new(cli).parse().unwrap();
        clear_env();

        assert_eq!(config.num_messages, 75);
        assert_eq!(config.transport, TransportKind::Symmetric);
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.ranks, 2);
        assert_eq!(config.test_config().num_stages, 2);
    }

    #[test]
    fn test_cli_mapping_replaces_env_mapping() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("PLT_RANKS_PER_NODE", "2");

        let cli = Cli::parse_from(["plt", "--node-ids", "0,1,1,1"]);
        let config = ConfigParser::new(cli).parse().unwrap();
        clear_env();

        assert_eq!(config.node_ids, Some(vec![0, 1, 1, 1]));
        assert!(config.ranks_per_node.is_none());
    }

    #[test]
    fn test_invalid_env_value_is_config_error() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("PLT_MESSAGES", "lots");

        let result = ConfigParser::new(Cli::parse_from(["plt"])).parse();
        clear_env();

        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_invalid_combination_fails_validation() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let cli = Cli::parse_from(["plt", "-r", "4", "--stages", "8"]);
        assert!(ConfigParser::new(cli).parse().is_err());

        let cli = Cli::parse_from(["plt", "-r", "4", "--node-ids", "0,1"]);
        assert!(ConfigParser::new(cli).parse().is_err());
    }

    #[test]
    fn test_color_flags_override_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("ENABLE_COLOR", "false");

        let config = ConfigParser::new(Cli::parse_from(["plt", "--color"])).parse().unwrap();
        assert!(config.enable_color);

        let config = ConfigParser::new(Cli::parse_from(["plt"])).parse().unwrap();
        assert!(!config.enable_color);
        clear_env();
    }

    #[test]
    fn test_display_config_summary() {
        let config = Config {
            ranks: 4,
            node_ids: Some(vec![0, 0, 1, 1]),
            ..Default::default()
        };
        let summary = display_config_summary(&config);
        assert!(summary.contains("Transport: two-sided"));
        assert!(summary.contains("Node ids: 0,0,1,1"));
        assert!(summary.contains("Stages: 4"));
        assert!(summary.contains("Max Polls: unlimited"));
    }
}
