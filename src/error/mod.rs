//! Error handling for the pairwise latency tester

pub mod recovery;

pub use recovery::{BackoffPolicy, BudgetExhausted, PollBudget, RetryPolicy};

use thiserror::Error;

/// Custom error types for the pairwise latency tester
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Parsing errors (rank lists, peer addresses, etc.)
    #[error("Parsing error: {0}")]
    Parse(String),

    /// I/O errors (report files, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// Transport resource allocation or registration failure
    #[error("Resource error on rank {rank}: {message}")]
    Resource { rank: usize, message: String },

    /// Transport protocol or connection failure
    #[error("Transport error on rank {rank} during {operation}: {message}")]
    Transport {
        rank: usize,
        operation: String,
        message: String,
    },

    /// A bounded wait (rendezvous, completion queue, barrier) ran out of budget
    #[error("Transport timeout on rank {rank}: {operation} did not complete after {waited_ms}ms ({polls} polls)")]
    TransportTimeout {
        rank: usize,
        operation: String,
        waited_ms: u64,
        polls: u64,
    },

    /// Measurement kernel errors
    #[error("Measurement error: {0}")]
    Measurement(String),

    /// Histogram aggregation errors
    #[error("Histogram error: {0}")]
    Histogram(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new parsing error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse(message.into())
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io(message.into())
    }

    /// Create a new resource error for the given rank
    pub fn resource<S: Into<String>>(rank: usize, message: S) -> Self {
        Self::Resource {
            rank,
            message: message.into(),
        }
    }

    /// Create a new transport error for the given rank and operation
    pub fn transport<O: Into<String>, S: Into<String>>(rank: usize, operation: O, message: S) -> Self {
        Self::Transport {
            rank,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a transport timeout from an exhausted polling budget
    pub fn transport_timeout<O: Into<String>>(rank: usize, operation: O, exhausted: BudgetExhausted) -> Self {
        Self::TransportTimeout {
            rank,
            operation: operation.into(),
            waited_ms: exhausted.waited.as_millis() as u64,
            polls: exhausted.polls,
        }
    }

    /// Create a new measurement error
    pub fn measurement<S: Into<String>>(message: S) -> Self {
        Self::Measurement(message.into())
    }

    /// Create a new histogram error
    pub fn histogram<S: Into<String>>(message: S) -> Self {
        Self::Histogram(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Get error category for logging and reporting
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Validation(_) => "VALIDATION",
            Self::Parse(_) => "PARSE",
            Self::Io(_) => "IO",
            Self::Resource { .. } => "RESOURCE",
            Self::Transport { .. } => "TRANSPORT",
            Self::TransportTimeout { .. } => "TIMEOUT",
            Self::Measurement(_) => "MEASUREMENT",
            Self::Histogram(_) => "HISTOGRAM",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Rank that raised the error, when it is rank-specific
    pub fn rank(&self) -> Option<usize> {
        match self {
            Self::Resource { rank, .. }
            | Self::Transport { rank, .. }
            | Self::TransportTimeout { rank, .. } => Some(*rank),
            _ => None,
        }
    }

    /// Check if rerunning the job could succeed without changing anything
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::TransportTimeout { .. } => true,
            Self::Config(_) | Self::Validation(_) | Self::Parse(_) => false,
            Self::Io(_) | Self::Resource { .. } | Self::Measurement(_) | Self::Histogram(_) | Self::Internal(_) => false,
        }
    }

    /// Get user-friendly error message with suggestions
    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::Config(msg) => {
                format!("Configuration problem: {}\n\nSuggestion: Check your .env file, PLT_* variables or command line arguments.", msg)
            }
            Self::Validation(msg) => {
                format!("Invalid input: {}\n\nSuggestion: Check rank counts, stage counts and node-id lists.", msg)
            }
            Self::Parse(msg) => {
                format!("Failed to parse input: {}\n\nSuggestion: Lists are comma-separated, peers use host:port.", msg)
            }
            Self::Io(msg) => {
                format!("File operation failed: {}\n\nSuggestion: Check file permissions and disk space.", msg)
            }
            Self::Resource { rank, message } => {
                format!("Rank {} could not acquire transport resources: {}\n\nSuggestion: Reduce --message-size or check registration limits on that node.", rank, message)
            }
            Self::Transport { rank, operation, message } => {
                format!("Rank {} failed during {}: {}\n\nSuggestion: Check that every peer is reachable and running the same configuration.", rank, operation, message)
            }
            Self::TransportTimeout { rank, operation, waited_ms, .. } => {
                format!("Rank {} gave up waiting on {} after {}ms.\n\nSuggestion: A peer may have crashed or be stuck; raise --poll-timeout-ms if the fabric is slow.", rank, operation, waited_ms)
            }
            Self::Measurement(msg) => {
                format!("Measurement failed: {}\n\nSuggestion: Check the timer calibration and message counts.", msg)
            }
            Self::Histogram(msg) => {
                format!("Histogram aggregation failed: {}\n\nSuggestion: All ranks must use the same bin layout.", msg)
            }
            Self::Internal(msg) => {
                format!("Internal error: {}\n\nThis is likely a bug. Please report this issue with the error details.", msg)
            }
        }
    }

    /// Get exit code for this error type
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Validation(_) | Self::Parse(_) => 1,
            Self::Transport { .. } => 2,
            Self::TransportTimeout { .. } => 3,
            Self::Resource { .. } => 4,
            Self::Io(_) => 5,
            Self::Measurement(_) | Self::Histogram(_) => 6,
            Self::Internal(_) => 99,
        }
    }

    /// Prepend context to the message while keeping the error category
    pub fn with_prefix(self, context: &str) -> Self {
        match self {
            Self::Config(msg) => Self::Config(format!("{}: {}", context, msg)),
            Self::Validation(msg) => Self::Validation(format!("{}: {}", context, msg)),
            Self::Parse(msg) => Self::Parse(format!("{}: {}", context, msg)),
            Self::Io(msg) => Self::Io(format!("{}: {}", context, msg)),
            Self::Resource { rank, message } => Self::Resource {
                rank,
                message: format!("{}: {}", context, message),
            },
            Self::Transport { rank, operation, message } => Self::Transport {
                rank,
                operation,
                message: format!("{}: {}", context, message),
            },
            timeout @ Self::TransportTimeout { .. } => timeout,
            Self::Measurement(msg) => Self::Measurement(format!("{}: {}", context, msg)),
            Self::Histogram(msg) => Self::Histogram(format!("{}: {}", context, msg)),
            Self::Internal(msg) => Self::Internal(format!("{}: {}", context, msg)),
        }
    }

    /// Format error for console display with color coding
    pub fn format_for_console(&self, use_color: bool) -> String {
        let category = self.category();
        let message = self.to_string();

        if use_color {
            use colored::Colorize;
            match self {
                Self::Config(_) | Self::Validation(_) | Self::Parse(_) => {
                    format!("[{}] {}", category.red().bold(), message.red())
                }
                Self::Transport { .. } | Self::Resource { .. } => {
                    format!("[{}] {}", category.yellow().bold(), message.yellow())
                }
                Self::TransportTimeout { .. } => {
                    format!("[{}] {}", category.blue().bold(), message.blue())
                }
                Self::Io(_) | Self::Measurement(_) | Self::Histogram(_) => {
                    format!("[{}] {}", category.cyan().bold(), message.cyan())
                }
                Self::Internal(_) => {
                    format!("[{}] {}", category.bright_red().bold(), message.bright_red())
                }
            }
        } else {
            format!("[{}] {}", category, message)
        }
    }
}

// Standard library error conversions
impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::io(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::parse(format!("JSON error: {}", error))
    }
}

impl From<dotenv::Error> for AppError {
    fn from(error: dotenv::Error) -> Self {
        Self::config(format!("Environment file error: {}", error))
    }
}

impl From<std::num::ParseIntError> for AppError {
    fn from(error: std::num::ParseIntError) -> Self {
        Self::parse(format!("Integer parse error: {}", error))
    }
}

impl From<std::num::ParseFloatError> for AppError {
    fn from(error: std::num::ParseFloatError) -> Self {
        Self::parse(format!("Float parse error: {}", error))
    }
}

impl From<std::str::ParseBoolError> for AppError {
    fn from(error: std::str::ParseBoolError) -> Self {
        Self::parse(format!("Boolean parse error: {}", error))
    }
}

impl From<std::net::AddrParseError> for AppError {
    fn from(error: std::net::AddrParseError) -> Self {
        Self::parse(format!("Socket address parse error: {}", error))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::internal(format!("Rank task failed to join: {}", error))
    }
}

// Anyhow integration
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error.to_string())
    }
}

/// Custom Result type for the application
pub type Result<T> = std::result::Result<T, AppError>;

/// Error context trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to an error
    fn context(self, message: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<AppError>,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_prefix(&f()))
    }

    fn context(self, message: &'static str) -> Result<T> {
        self.with_context(|| message.to_string())
    }
}

/// Error reporter for structured error output at process exit
pub struct ErrorReporter {
    pub use_color: bool,
    pub verbose: bool,
}

impl ErrorReporter {
    /// Create a new error reporter
    pub fn new(use_color: bool, verbose: bool) -> Self {
        Self { use_color, verbose }
    }

    /// Render an error for the user
    pub fn render(&self, error: &AppError) -> String {
        let mut out = error.format_for_console(self.use_color);

        if self.verbose {
            out.push_str("\n\n");
            out.push_str(&error.user_friendly_message());

            if error.is_recoverable() {
                out.push_str("\n\n");
                let hint = "This failure may be transient. Rerunning the job can succeed.";
                if self.use_color {
                    use colored::Colorize;
                    out.push_str(&hint.green().to_string());
                } else {
                    out.push_str(hint);
                }
            }
        }

        out
    }

    /// Report an error to stderr
    pub fn report_error(&self, error: &AppError) {
        eprintln!("{}", self.render(error));
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(true, false)
    }
}
