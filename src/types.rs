//! Type definitions and aliases

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use crate::error::{AppError, Result};

/// Identifier of the physical node a rank runs on
pub type NodeId = u64;

/// Communication mechanism used for the timed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Combined send/receive message passing
    #[default]
    TwoSided,
    /// One-sided get from the peer's symmetric region
    Symmetric,
    /// Remote put with explicit completion-queue polling
    Rdma,
    /// Two-sided exchange over TCP sockets, one process per rank
    Tcp,
}

impl TransportKind {
    /// All supported kinds in display order
    pub const ALL: [TransportKind; 4] = [Self::TwoSided, Self::Symmetric, Self::Rdma, Self::Tcp];

    /// Name as accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TwoSided => "two-sided",
            Self::Symmetric => "symmetric",
            Self::Rdma => "rdma",
            Self::Tcp => "tcp",
        }
    }

    /// Whether every rank runs inside this process over the shared fabric
    pub fn is_in_process(&self) -> bool {
        !matches!(self, Self::Tcp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two-sided" | "twosided" | "mpi" => Ok(Self::TwoSided),
            "symmetric" | "shmem" => Ok(Self::Symmetric),
            "rdma" | "ugni" => Ok(Self::Rdma),
            "tcp" => Ok(Self::Tcp),
            other => Err(AppError::parse(format!(
                "Unknown transport '{}', expected one of: two-sided, symmetric, rdma, tcp",
                other
            ))),
        }
    }
}

/// Whether two ranks share a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    OnNode,
    OffNode,
}

impl Locality {
    pub fn from_same_node(same: bool) -> Self {
        if same {
            Self::OnNode
        } else {
            Self::OffNode
        }
    }
}

/// Report rendering format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(AppError::parse(format!("Unknown output format '{}', expected text or json", other))),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}
