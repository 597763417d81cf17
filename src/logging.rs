//! Structured logging for the pairwise latency tester
//!
//! This module provides:
//! - Structured logging with multiple levels and shared context fields
//! - A `rank` context field on every per-rank logger
//! - Measurement progress logging (pairings, stage skips, run summary)
//! - Transport event logging (connections, completion-queue errors)
//! - Error event logging with rank and operation
//!
//! All output goes to stderr so that stdout carries only the report.

use crate::error::{AppError, Result};
use crate::histogram::PairingStats;
use crate::models::Config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level - most detailed
    Trace = 0,
    /// Debug level - per-pairing statistics
    Debug = 1,
    /// Info level - run progress
    Info = 2,
    /// Warning level - retried transport faults, configuration concerns
    Warn = 3,
    /// Error level - a rank failed
    Error = 4,
    /// Fatal level - the run is aborted
    Fatal = 5,
}

impl LogLevel {
    /// Get log level name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Get ANSI color code for console output
    pub fn color_code(&self) -> &'static str {
        match self {
            LogLevel::Trace => "\x1b[37m",
            LogLevel::Debug => "\x1b[36m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Error => "\x1b[31m",
            LogLevel::Fatal => "\x1b[35m",
        }
    }

    /// Reset ANSI color code
    pub fn reset_code() -> &'static str {
        "\x1b[0m"
    }
}

impl std::str::FromStr for LogLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(AppError::parse(format!("Invalid log level: {}", s))),
        }
    }
}

/// Log entry structure for structured logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Logger name/component
    pub logger: String,
    /// Correlation ID for tracking related events
    pub correlation_id: Option<String>,
    pub fields: HashMap<String, serde_json::Value>,
    pub location: Option<LogLocation>,
}

/// Source code location information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLocation {
    pub file: String,
    pub line: u32,
    pub module: Option<String>,
}

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable console format
    Console,
    /// JSON format for structured logging
    Json,
    /// Compact single-line format
    Compact,
}

/// Shared logging context for correlation and session tracking
#[derive(Debug, Default, Clone)]
struct LogContext {
    session_id: Option<String>,
    current_correlation_id: Option<String>,
    context_fields: HashMap<String, serde_json::Value>,
}

/// Logger implementation with multiple output formats
#[derive(Debug, Clone)]
pub struct Logger {
    min_level: LogLevel,
    use_color: bool,
    include_location: bool,
    format: LogFormat,
    name: String,
    context: Arc<RwLock<LogContext>>,
}

impl Logger {
    /// Create a new logger
    pub fn new(name: String) -> Self {
        Self {
            min_level: LogLevel::Info,
            use_color: true,
            include_location: false,
            format: LogFormat::Console,
            name,
            context: Arc::new(RwLock::new(LogContext::default())),
        }
    }

    /// Create a logger with specific configuration
    pub fn with_config(name: String, config: &Config) -> Self {
        let min_level = if config.debug {
            LogLevel::Debug
        } else if config.verbose {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };

        Self {
            min_level,
            use_color: config.enable_color,
            include_location: config.debug,
            format: if config.debug { LogFormat::Json } else { LogFormat::Console },
            name,
            context: Arc::new(RwLock::new(LogContext::default())),
        }
    }

    /// Logger that never writes, for tests and library callers without output
    pub fn silent(name: &str) -> Self {
        let mut logger = Self::new(name.to_string());
        logger.min_level = LogLevel::Fatal;
        logger.use_color = false;
        logger
    }

    /// Child logger with the same settings, a copy of the context and a `rank` field
    pub async fn for_rank(&self, rank: usize) -> Logger {
        let mut context = self.context.read().await.clone();
        context.context_fields.insert("rank".to_string(), serde_json::Value::from(rank));

        Logger {
            min_level: self.min_level,
            use_color: self.use_color,
            include_location: self.include_location,
            format: self.format,
            name: self.name.clone(),
            context: Arc::new(RwLock::new(context)),
        }
    }

    /// Same settings and context under another component name
    pub fn named(&self, name: &str) -> Logger {
        Logger {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    /// Set minimum log level
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Set output format
    pub fn set_format(&mut self, format: LogFormat) {
        self.format = format;
    }

    /// Enable or disable colored output
    pub fn set_color(&mut self, use_color: bool) {
        self.use_color = use_color;
    }

    /// Set session correlation ID
    pub async fn set_session_id(&self, session_id: String) {
        let mut context = self.context.write().await;
        context.session_id = Some(session_id);
    }

    /// Add context field for all subsequent log entries
    pub async fn add_context_field<T: Serialize>(&self, key: String, value: T) {
        if let Ok(json_value) = serde_json::to_value(value) {
            let mut context = self.context.write().await;
            context.context_fields.insert(key, json_value);
        }
    }

    /// Start a correlated operation
    pub async fn start_operation(&self, operation_name: &str) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        {
            let mut context = self.context.write().await;
            context.current_correlation_id = Some(correlation_id.clone());
        }

        self.debug(&format!("Started operation: {}", operation_name))
            .correlation_id(&correlation_id)
            .field("operation", operation_name)
            .field("operation_type", "start")
            .log()
            .await;

        correlation_id
    }

    /// Correlation id attached to entries logged right now
    pub async fn current_correlation_id(&self) -> Option<String> {
        self.context.read().await.current_correlation_id.clone()
    }

    /// End a correlated operation
    pub async fn end_operation(&self, correlation_id: &str, operation_name: &str, success: bool) {
        self.debug(&format!("Completed operation: {} (success: {})", operation_name, success))
            .correlation_id(correlation_id)
            .field("operation", operation_name)
            .field("operation_type", "end")
            .field("success", success)
            .log()
            .await;

        let mut context = self.context.write().await;
        if context.current_correlation_id.as_deref() == Some(correlation_id) {
            context.current_correlation_id = None;
        }
    }

    /// Create a log entry builder
    pub fn log(&self, level: LogLevel, message: &str) -> LogEntryBuilder {
        LogEntryBuilder::new(self, level, message.to_string())
    }

    pub fn trace(&self, message: &str) -> LogEntryBuilder {
        self.log(LogLevel::Trace, message)
    }

    pub fn debug(&self, message: &str) -> LogEntryBuilder {
        self.log(LogLevel::Debug, message)
    }

    pub fn info(&self, message: &str) -> LogEntryBuilder {
        self.log(LogLevel::Info, message)
    }

    pub fn warn(&self, message: &str) -> LogEntryBuilder {
        self.log(LogLevel::Warn, message)
    }

    pub fn error(&self, message: &str) -> LogEntryBuilder {
        self.log(LogLevel::Error, message)
    }

    pub fn fatal(&self, message: &str) -> LogEntryBuilder {
        self.log(LogLevel::Fatal, message)
    }

    /// Check if a log level would be output
    pub fn would_log(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Render an entry with the shared context applied, `None` if filtered out
    async fn render(&self, mut entry: LogEntry) -> Option<String> {
        if entry.level < self.min_level {
            return None;
        }

        let context = self.context.read().await;
        if let Some(session_id) = &context.session_id {
            entry
                .fields
                .insert("session_id".to_string(), serde_json::Value::String(session_id.clone()));
        }
        if entry.correlation_id.is_none() {
            entry.correlation_id = context.current_correlation_id.clone();
        }
        for (key, value) in &context.context_fields {
            entry.fields.insert(key.clone(), value.clone());
        }
        drop(context);

        Some(match self.format {
            LogFormat::Console => self.format_console(&entry),
            LogFormat::Json => self.format_json(&entry),
            LogFormat::Compact => self.format_compact(&entry),
        })
    }

    async fn write_entry(&self, entry: LogEntry) {
        if let Some(output) = self.render(entry).await {
            let _ = writeln!(io::stderr(), "{}", output);
        }
    }

    /// Format log entry for console output
    fn format_console(&self, entry: &LogEntry) -> String {
        let timestamp = entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
        let level_str = entry.level.as_str();

        let formatted_level = if self.use_color {
            format!("{}{:>5}{}", entry.level.color_code(), level_str, LogLevel::reset_code())
        } else {
            format!("{:>5}", level_str)
        };

        let mut output = format!("{} {} [{}] {}", timestamp, formatted_level, entry.logger, entry.message);

        if let Some(correlation_id) = &entry.correlation_id {
            let short: String = correlation_id.chars().take(8).collect();
            output.push_str(&format!(" [{}]", short));
        }

        if !entry.fields.is_empty() {
            let mut fields: Vec<String> = entry.fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            fields.sort();
            output.push_str(&format!(" {{{}}}", fields.join(", ")));
        }

        if self.include_location {
            if let Some(location) = &entry.location {
                output.push_str(&format!(" @ {}:{}", location.file, location.line));
            }
        }

        output
    }

    /// Format log entry as JSON
    fn format_json(&self, entry: &LogEntry) -> String {
        match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(_) => format!(
                "{{\"error\": \"Failed to serialize log entry\", \"message\": \"{}\"}}",
                entry.message
            ),
        }
    }

    /// Format log entry in compact format
    fn format_compact(&self, entry: &LogEntry) -> String {
        let timestamp = entry.timestamp.format("%H:%M:%S");
        let rank = entry
            .fields
            .get("rank")
            .map(|r| format!(" r{}", r))
            .unwrap_or_default();
        format!(
            "{} {}{} {}: {}",
            timestamp,
            entry.level.as_str().chars().next().unwrap_or('?'),
            rank,
            entry.logger,
            entry.message
        )
    }
}

/// Builder pattern for creating log entries
pub struct LogEntryBuilder<'a> {
    logger: &'a Logger,
    entry: LogEntry,
}

impl<'a> LogEntryBuilder<'a> {
    fn new(logger: &'a Logger, level: LogLevel, message: String) -> Self {
        Self {
            logger,
            entry: LogEntry {
                timestamp: Utc::now(),
                level,
                message,
                logger: logger.name.clone(),
                correlation_id: None,
                fields: HashMap::new(),
                location: None,
            },
        }
    }

    /// Add a correlation ID
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.entry.correlation_id = Some(id.to_string());
        self
    }

    /// Add a structured field
    pub fn field<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.entry.fields.insert(key.to_string(), json_value);
        }
        self
    }

    /// Add location information
    pub fn location(mut self, file: &str, line: u32, module: Option<&str>) -> Self {
        self.entry.location = Some(LogLocation {
            file: file.to_string(),
            line,
            module: module.map(String::from),
        });
        self
    }

    /// Add per-pairing sample statistics
    pub fn pairing(self, stats: &PairingStats) -> Self {
        self.field("binned", stats.binned)
            .field("dropped", stats.dropped)
            .field("min_one_sided_s", stats.min_one_sided)
            .field("min_pairwise_s", stats.min_pairwise)
    }

    /// Add error information
    pub fn error_info(self, error: &AppError) -> Self {
        let builder = self
            .field("error_category", error.category())
            .field("error_recoverable", error.is_recoverable())
            .field("error_exit_code", error.exit_code());
        match error.rank() {
            Some(rank) => builder.field("failed_rank", rank),
            None => builder,
        }
    }

    /// Finalize and write the log entry
    pub async fn log(self) {
        self.logger.write_entry(self.entry).await;
    }
}

/// Progress of one rank's measurement loop
#[derive(Debug, Clone)]
pub struct MeasurementLogger {
    logger: Logger,
}

impl MeasurementLogger {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.named("MEAS"),
        }
    }

    /// Log a finished pairing with its sample statistics
    pub async fn log_pairing_complete(&self, cycle: usize, stage: usize, peer: usize, on_node: bool, stats: &PairingStats) {
        let message = format!(
            "Pairing with rank {} done (cycle {}, stage {}): {} samples binned, {} dropped",
            peer, cycle, stage, stats.binned, stats.dropped
        );
        self.logger
            .debug(&message)
            .field("cycle", cycle)
            .field("stage", stage)
            .field("peer", peer)
            .field("on_node", on_node)
            .pairing(stats)
            .log()
            .await;
    }

    /// Open a correlated operation covering one pairing
    pub async fn start_operation(&self, operation: &str) -> String {
        self.logger.start_operation(operation).await
    }

    pub async fn end_operation(&self, correlation_id: &str, operation: &str, success: bool) {
        self.logger.end_operation(correlation_id, operation, success).await;
    }

    /// Log a stage without a valid partner
    pub async fn log_stage_skipped(&self, cycle: usize, stage: usize) {
        self.logger
            .trace(&format!("No partner in cycle {}, stage {}", cycle, stage))
            .field("cycle", cycle)
            .field("stage", stage)
            .log()
            .await;
    }

    /// Log the end of a rank's run
    pub async fn log_rank_summary(&self, measured: usize, skipped: usize, dropped: u64, duration: std::time::Duration) {
        let message = format!(
            "Rank finished: {} pairings measured, {} stages skipped, {} samples dropped in {:.3}s",
            measured,
            skipped,
            dropped,
            duration.as_secs_f64()
        );
        let level = if dropped > 0 { LogLevel::Warn } else { LogLevel::Info };
        self.logger
            .log(level, &message)
            .field("pairings_measured", measured)
            .field("pairings_skipped", skipped)
            .field("dropped_samples", dropped)
            .field("duration_ms", duration.as_secs_f64() * 1000.0)
            .log()
            .await;
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

/// Transport-level events
#[derive(Debug, Clone)]
pub struct TransportLogger {
    logger: Logger,
}

impl TransportLogger {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.named("NET"),
        }
    }

    /// Log a connection attempt to a peer
    pub async fn log_connection(&self, peer: usize, target: &str, success: bool, error: Option<&str>) {
        let level = if success { LogLevel::Debug } else { LogLevel::Warn };
        let message = if success {
            format!("Connected to rank {} at {}", peer, target)
        } else {
            format!(
                "Failed to connect to rank {} at {}: {}",
                peer,
                target,
                error.unwrap_or("unknown error")
            )
        };

        let mut builder = self
            .logger
            .log(level, &message)
            .field("peer", peer)
            .field("target", target)
            .field("success", success);
        if let Some(err) = error {
            builder = builder.field("error", err);
        }
        builder.log().await;
    }

    /// Log a completion-queue transaction error that will be re-polled
    pub async fn log_transaction_error(&self, peer: usize, queue: &str, detail: &str) {
        self.logger
            .warn(&format!(
                "Transaction error on {} completion queue while exchanging with rank {}: {}",
                queue, peer, detail
            ))
            .field("peer", peer)
            .field("queue", queue)
            .field("detail", detail)
            .log()
            .await;
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

/// Error event logger with rank and operation context
#[derive(Debug, Clone)]
pub struct ErrorEventLogger {
    logger: Logger,
}

impl ErrorEventLogger {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.named("ERR"),
        }
    }

    /// Log an application error with full context
    pub async fn log_error(&self, error: &AppError, context: Option<&str>, correlation_id: Option<&str>) {
        let message = match context {
            Some(ctx) => format!("{}: {}", ctx, error),
            None => error.to_string(),
        };

        let mut builder = self.logger.error(&message).error_info(error);
        if let Some(id) = correlation_id {
            builder = builder.correlation_id(id);
        }
        if let Some(ctx) = context {
            builder = builder.field("context", ctx);
        }
        builder.log().await;
    }

    /// Log the error that aborted the whole run
    pub async fn log_abort(&self, error: &AppError) {
        self.logger
            .fatal(&format!("Run aborted: {}", error))
            .error_info(error)
            .log()
            .await;
    }
}

/// Global logger factory and management
pub struct LoggerFactory {
    config: Config,
    session_id: String,
}

impl LoggerFactory {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create a logger with a specific name and the session id
    pub async fn create_logger(&self, name: &str) -> Logger {
        let logger = Logger::with_config(name.to_string(), &self.config);
        logger.set_session_id(self.session_id.clone()).await;
        logger
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Convenience macros for logging with location information
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(&format!($($arg)*))
            .location(file!(), line!(), Some(module_path!()))
            .log()
            .await
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.info(&format!($($arg)*))
            .location(file!(), line!(), Some(module_path!()))
            .log()
            .await
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn entry(level: LogLevel) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level,
            message: "Test message".to_string(),
            logger: "TEST".to_string(),
            correlation_id: Some("0123456789abcdef".to_string()),
            fields: HashMap::new(),
            location: None,
        }
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("DEBUG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert!(LogLevel::from_str("invalid").is_err());
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn test_logger_with_config() {
        let config = Config {
            debug: true,
            enable_color: false,
            ..Default::default()
        };
        let logger = Logger::with_config("TEST".to_string(), &config);
        assert_eq!(logger.level(), LogLevel::Debug);
        assert!(!logger.use_color);
        assert!(logger.include_location);

        let quiet = Logger::with_config("TEST".to_string(), &Config::default());
        assert_eq!(quiet.level(), LogLevel::Warn);
        assert!(!quiet.would_log(LogLevel::Info));
        assert!(quiet.would_log(LogLevel::Warn));
    }

    #[tokio::test]
    async fn test_rank_logger_carries_rank_field() {
        let mut logger = Logger::new("TEST".to_string());
        logger.set_color(false);
        logger.set_format(LogFormat::Json);
        logger.set_session_id("session-1".to_string()).await;

        let ranked = logger.for_rank(3).await;
        let line = ranked.render(entry(LogLevel::Warn)).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed["fields"]["rank"], 3);
        assert_eq!(parsed["fields"]["session_id"], "session-1");

        // The parent context is untouched.
        let parent = logger.render(entry(LogLevel::Warn)).await.unwrap();
        assert!(!parent.contains("\"rank\""));
    }

    #[tokio::test]
    async fn test_level_filtering() {
        let mut logger = Logger::silent("TEST");
        assert!(logger.render(entry(LogLevel::Error)).await.is_none());
        assert!(logger.render(entry(LogLevel::Fatal)).await.is_some());

        logger.set_level(LogLevel::Warn);
        assert!(logger.render(entry(LogLevel::Warn)).await.is_some());
        assert!(logger.render(entry(LogLevel::Info)).await.is_none());
    }

    #[tokio::test]
    async fn test_operation_correlation() {
        let logger = Logger::silent("TEST");
        let correlation_id = logger.start_operation("pairing").await;
        assert!(!correlation_id.is_empty());
        assert_eq!(logger.current_correlation_id().await, Some(correlation_id.clone()));
        logger.end_operation(&correlation_id, "pairing", true).await;
        assert!(logger.current_correlation_id().await.is_none());
    }

    #[test]
    fn test_log_formats() {
        let mut logger = Logger::new("TEST".to_string());
        logger.set_color(false);

        let mut e = entry(LogLevel::Info);
        e.fields.insert("rank".to_string(), serde_json::Value::from(2));

        let console = logger.format_console(&e);
        assert!(console.contains("INFO"));
        assert!(console.contains("Test message"));
        assert!(console.contains("[01234567]"));
        assert!(console.contains("rank=2"));

        let json = logger.format_json(&e);
        assert!(json.starts_with('{') && json.ends_with('}'));

        let compact = logger.format_compact(&e);
        assert!(compact.contains("I r2 TEST: Test message"));
    }

    #[tokio::test]
    async fn test_specialized_loggers() {
        let base = Logger::silent("TEST");

        let measurement = MeasurementLogger::new(base.clone());
        assert_eq!(measurement.logger().name(), "MEAS");
        measurement
            .log_pairing_complete(0, 1, 1, true, &PairingStats::default())
            .await;
        measurement.log_stage_skipped(0, 0).await;
        measurement
            .log_rank_summary(3, 1, 0, std::time::Duration::from_millis(5))
            .await;

        let transport = TransportLogger::new(base.clone());
        assert_eq!(transport.logger().name(), "NET");
        transport.log_connection(1, "127.0.0.1:7001", false, Some("refused")).await;
        transport.log_transaction_error(1, "tx", "injected").await;

        let errors = ErrorEventLogger::new(base);
        let error = AppError::transport(1, "exchange", "peer hung up");
        errors.log_error(&error, Some("stage 2"), None).await;
        errors.log_abort(&error).await;
    }

    #[tokio::test]
    async fn test_logger_factory() {
        let factory = LoggerFactory::new(Config::default());
        let logger = factory.create_logger("APP").await;
        assert_eq!(logger.name(), "APP");
        assert!(!factory.session_id().is_empty());
    }

    #[test]
    fn test_log_entry_serialization() {
        let e = entry(LogLevel::Info);
        let json = serde_json::to_string(&e).unwrap();
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.level, LogLevel::Info);
        assert_eq!(back.logger, "TEST");
    }
}
