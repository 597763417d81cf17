//! Environment variable handling and .env file management

use crate::error::{AppError, Result};
use crate::topology::parse_node_ids;
use crate::types::{OutputFormat, TransportKind};
use std::path::Path;

/// Environment variable configuration manager
pub struct EnvManager;

impl EnvManager {
    /// Load .env file if it exists; variables already set in the environment win
    pub fn load_env_file(debug: bool) -> Result<()> {
        if Path::new(".env").exists() {
            dotenv::from_filename(".env")
                .map_err(|e| AppError::config(format!("Failed to load .env file: {}", e)))?;

            if debug {
                eprintln!("Loaded configuration from .env file");
            }
        } else if debug {
            eprintln!("No .env file found, using defaults and CLI arguments");
        }

        Ok(())
    }

    /// Create example .env file content
    pub fn create_example_env_content() -> String {
        r#"# Pairwise Latency Tester Configuration
#
# Values set here are used as defaults and can be overridden by
# environment variables and command-line arguments.

# Repetitions of the full stage sequence
# PLT_CYCLES=1

# Stages per cycle (defaults to the next power of two of the rank count)
# PLT_STAGES=4

# Timed exchanges per pairing
# PLT_MESSAGES=1000

# Untimed exchanges before each pairing
# PLT_WARMUP=10

# Exchange buffer size in bytes
# PLT_MESSAGE_SIZE=8

# Transport backend: two-sided, symmetric, rdma, tcp
# PLT_TRANSPORT=two-sided

# Ranks in the local cluster
# PLT_RANKS=4

# Node id per rank, or consecutive ranks per node
# PLT_NODE_IDS=0,0,1,1
# PLT_RANKS_PER_NODE=2

# TCP jobs: this process's rank and every rank's address
# PLT_RANK=0
# PLT_PEERS=10.0.0.1:7100,10.0.0.2:7100

# Bounded waiting for rendezvous, barriers and completion queues
# PLT_POLL_TIMEOUT_MS=30000
# PLT_MAX_POLLS=0

# Histogram resolution
# PLT_BINS_PER_DECADE=50

# Report format: text or json
# PLT_FORMAT=text

# Enable colored output (true/false)
# ENABLE_COLOR=true
"#
        .to_string()
    }

    /// Save example .env file to disk
    pub fn save_example_env_file(path: &Path) -> Result<()> {
        let content = Self::create_example_env_content();
        std::fs::write(path, content)
            .map_err(|e| AppError::config(format!("Failed to write example .env file: {}", e)))?;

        Ok(())
    }

    /// Validate environment variable format before parsing
    pub fn validate_env_var(key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "PLT_CYCLES" | "PLT_MESSAGES" | "PLT_RANKS" | "PLT_RANKS_PER_NODE" | "PLT_STAGES" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, value, e)))?;
                if parsed == 0 {
                    return Err(AppError::config(format!("{} must be greater than 0", key)));
                }
            }
            "PLT_WARMUP" | "PLT_MESSAGE_SIZE" | "PLT_RANK" => {
                value
                    .parse::<usize>()
                    .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, value, e)))?;
            }
            "PLT_POLL_TIMEOUT_MS" => {
                let timeout: u64 = value
                    .parse()
                    .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, value, e)))?;
                if timeout == 0 {
                    return Err(AppError::config("PLT_POLL_TIMEOUT_MS must be greater than 0"));
                }
            }
            "PLT_MAX_POLLS" => {
                value
                    .parse::<u64>()
                    .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, value, e)))?;
            }
            "PLT_BINS_PER_DECADE" => {
                let bins: u32 = value
                    .parse()
                    .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, value, e)))?;
                if bins == 0 {
                    return Err(AppError::config("PLT_BINS_PER_DECADE must be greater than 0"));
                }
            }
            "PLT_TRANSPORT" => {
                value.parse::<TransportKind>()?;
            }
            "PLT_FORMAT" => {
                value.parse::<OutputFormat>()?;
            }
            "PLT_NODE_IDS" => {
                parse_node_ids(value)?;
            }
            "PLT_PEERS" => {
                for peer in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    if !peer.contains(':') {
                        return Err(AppError::config(format!(
                            "Invalid PLT_PEERS entry '{}': expected host:port",
                            peer
                        )));
                    }
                }
            }
            "ENABLE_COLOR" => {
                value
                    .parse::<bool>()
                    .map_err(|e| AppError::config(format!("Invalid ENABLE_COLOR value '{}': {}", value, e)))?;
            }
            _ => {
                // Unknown environment variable, ignore
            }
        }

        Ok(())
    }

    /// Get list of all supported environment variables with descriptions
    pub fn get_supported_env_vars() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("PLT_CYCLES", "Repetitions of the full stage sequence", "1"),
            ("PLT_STAGES", "Stages per cycle", "4"),
            ("PLT_MESSAGES", "Timed exchanges per pairing", "1000"),
            ("PLT_WARMUP", "Untimed exchanges before each pairing", "10"),
            ("PLT_MESSAGE_SIZE", "Exchange buffer size in bytes", "8"),
            ("PLT_TRANSPORT", "Backend: two-sided, symmetric, rdma, tcp", "rdma"),
            ("PLT_RANKS", "Ranks in the local cluster", "4"),
            ("PLT_NODE_IDS", "Comma-separated node id per rank", "0,0,1,1"),
            ("PLT_RANKS_PER_NODE", "Consecutive ranks sharing a node", "2"),
            ("PLT_RANK", "Rank of this process (tcp)", "0"),
            ("PLT_PEERS", "Comma-separated host:port of every rank (tcp)", "node1:7100,node2:7100"),
            ("PLT_POLL_TIMEOUT_MS", "Deadline of a single wait in milliseconds", "30000"),
            ("PLT_MAX_POLLS", "Polls per wait before giving up, 0 for no limit", "0"),
            ("PLT_BINS_PER_DECADE", "Histogram bins per decade of latency", "50"),
            ("PLT_FORMAT", "Report format: text or json", "json"),
            ("ENABLE_COLOR", "Enable colored output", "true"),
        ]
    }

    /// Display environment variable help
    pub fn display_env_help() -> String {
        let mut help = String::new();
        help.push_str("Supported Environment Variables:\n\n");

        for (var, description, example) in Self::get_supported_env_vars() {
            help.push_str(&format!("  {:<20} {}\n", var, description));
            help.push_str(&format!("  {:<20} Example: {}\n\n", "", example));
        }

        help.push_str("Configuration Priority (highest to lowest):\n");
        help.push_str("  1. Command-line arguments\n");
        help.push_str("  2. Environment variables\n");
        help.push_str("  3. .env file values\n");
        help.push_str("  4. Default values\n");

        help
    }

    /// Validate all currently set environment variables
    pub fn validate_current_env() -> Vec<String> {
        let mut warnings = Vec::new();

        for (var_name, _, _) in Self::get_supported_env_vars() {
            if let Ok(value) = std::env::var(var_name) {
                if let Err(e) = Self::validate_env_var(var_name, &value) {
                    warnings.push(format!("Warning: {}", e));
                }
            }
        }

        warnings
    }

    /// Check if .env file exists and validate its contents
    pub fn check_env_file(path: &Path) -> Result<Option<Vec<String>>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("Failed to read .env file: {}", e)))?;

        let mut warnings = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                if let Err(e) = Self::validate_env_var(key.trim(), value) {
                    warnings.push(format!("Line '{}': {}", line, e));
                }
            }
        }

        Ok(Some(warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_example_content_lists_every_variable() {
        let content = EnvManager::create_example_env_content();
        for (var, _, _) in EnvManager::get_supported_env_vars() {
            assert!(content.contains(&format!("{}=", var)), "missing {}", var);
        }
    }

    #[test]
    fn test_save_example_file() {
        let temp_file = NamedTempFile::new().unwrap();
        EnvManager::save_example_env_file(temp_file.path()).unwrap();

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert!(content.contains("Pairwise Latency Tester Configuration"));
    }

    #[test]
    fn test_validate_env_var() {
        assert!(EnvManager::validate_env_var("PLT_MESSAGES", "100").is_ok());
        assert!(EnvManager::validate_env_var("PLT_WARMUP", "0").is_ok());
        assert!(EnvManager::validate_env_var("PLT_TRANSPORT", "shmem").is_ok());
        assert!(EnvManager::validate_env_var("PLT_FORMAT", "json").is_ok());
        assert!(EnvManager::validate_env_var("PLT_NODE_IDS", "0, 0, 1, 1").is_ok());
        assert!(EnvManager::validate_env_var("PLT_PEERS", "a:1,b:2").is_ok());
        assert!(EnvManager::validate_env_var("ENABLE_COLOR", "false").is_ok());
        assert!(EnvManager::validate_env_var("UNRELATED", "whatever").is_ok());

        assert!(EnvManager::validate_env_var("PLT_MESSAGES", "0").is_err());
        assert!(EnvManager::validate_env_var("PLT_RANKS", "-2").is_err());
        assert!(EnvManager::validate_env_var("PLT_POLL_TIMEOUT_MS", "0").is_err());
        assert!(EnvManager::validate_env_var("PLT_TRANSPORT", "smoke-signal").is_err());
        assert!(EnvManager::validate_env_var("PLT_NODE_IDS", "0,x").is_err());
        assert!(EnvManager::validate_env_var("PLT_PEERS", "nohostport").is_err());
        assert!(EnvManager::validate_env_var("ENABLE_COLOR", "maybe").is_err());
    }

    #[test]
    fn test_display_env_help() {
        let help = EnvManager::display_env_help();
        assert!(help.contains("Supported Environment Variables:"));
        assert!(help.contains("PLT_TRANSPORT"));
        assert!(help.contains("Configuration Priority"));
        assert!(help.contains("Command-line arguments"));
    }

    #[test]
    fn test_check_env_file() {
        let missing = std::path::Path::new("/nonexistent/plt/.env");
        assert!(EnvManager::check_env_file(missing).unwrap().is_none());

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "# comment\nPLT_MESSAGES=10\nPLT_TRANSPORT=bogus\n").unwrap();
        let warnings = EnvManager::check_env_file(file.path()).unwrap().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("PLT_TRANSPORT=bogus"));
    }

    #[test]
    fn test_validate_current_env_empty() {
        let _guard = crate::config::ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for (var_name, _, _) in EnvManager::get_supported_env_vars() {
            std::env::remove_var(var_name);
        }
        assert!(EnvManager::validate_current_env().is_empty());
    }
}
