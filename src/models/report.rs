//! Per-rank and job-wide measurement results

use super::config::TestConfig;
use crate::error::Result;
use crate::histogram::{HistogramSet, HistogramSummary};
use crate::topology::RankTopology;
use crate::types::TransportKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What one rank measured
#[derive(Debug, Clone, Serialize)]
pub struct RankReport {
    pub rank: usize,
    /// Pairings that ran the timed kernel
    pub pairings_measured: usize,
    /// Stages without a valid partner
    pub pairings_skipped: usize,
    /// Invalid samples excluded from the histograms
    pub dropped_samples: u64,
    #[serde(skip)]
    pub histograms: HistogramSet,
}

impl RankReport {
    pub fn summaries(&self) -> Vec<HistogramSummary> {
        self.histograms.summaries()
    }
}

/// Merged results of every rank in the job
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub transport: TransportKind,
    pub clock: String,
    pub num_ranks: usize,
    pub test: TestConfig,
    pub topology: RankTopology,
    pub ranks: Vec<RankReport>,
    pub histograms: HistogramSet,
}

impl ClusterReport {
    /// Merge per-rank histograms into a job-wide report
    #[allow(clippy::too_many_arguments)]
    pub fn from_ranks(
        session_id: String,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        transport: TransportKind,
        clock: String,
        test: TestConfig,
        topology: RankTopology,
        mut ranks: Vec<RankReport>,
        mut histograms: HistogramSet,
    ) -> Result<Self> {
        ranks.sort_by_key(|report| report.rank);
        for report in &ranks {
            histograms.merge(&report.histograms)?;
        }
        Ok(Self {
            session_id,
            started_at,
            duration_ms,
            transport,
            clock,
            num_ranks: topology.num_ranks(),
            test,
            topology,
            ranks,
            histograms,
        })
    }

    pub fn pairings_measured(&self) -> usize {
        self.ranks.iter().map(|r| r.pairings_measured).sum()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.ranks.iter().map(|r| r.dropped_samples).sum()
    }

    pub fn summaries(&self) -> Vec<HistogramSummary> {
        self.histograms.summaries()
    }
}
