//! Multi-rank runners
//!
//! [`LocalCluster`] runs every rank of the job as a tokio task over a shared
//! [`LocalFabric`] and merges their reports. [`TcpRank`] runs the single rank
//! of this process over a TCP mesh; rank 0 gathers and merges the reports of
//! all ranks.

use crate::engine::Engine;
use crate::error::{AppError, BackoffPolicy, Result, RetryPolicy};
use crate::histogram::{BinLayout, HistogramSet};
use crate::logging::{ErrorEventLogger, Logger};
use crate::models::{ClusterReport, RankReport, TestConfig};
use crate::timer::{default_clock, Clock};
use crate::topology::RankTopology;
use crate::transport::{local_transport, LocalFabric, TcpTransport};
use crate::types::{NodeId, TransportKind};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Builds the clock each rank measures with
pub type ClockFactory = fn() -> Box<dyn Clock>;

/// Parameters shared by every rank of a run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub transport: TransportKind,
    pub test: TestConfig,
    pub topology: Arc<RankTopology>,
    pub layout: BinLayout,
    pub policy: RetryPolicy,
}

impl RunPlan {
    pub fn num_ranks(&self) -> usize {
        self.topology.num_ranks()
    }
}

/// All ranks of the job inside this process
pub struct LocalCluster {
    plan: RunPlan,
    fabric: Arc<LocalFabric>,
    clock: ClockFactory,
}

impl LocalCluster {
    pub fn new(plan: RunPlan) -> Self {
        let fabric = LocalFabric::new(plan.num_ranks());
        Self::with_fabric(plan, fabric)
    }

    /// Run over a prepared fabric, e.g. one with injected faults
    pub fn with_fabric(plan: RunPlan, fabric: Arc<LocalFabric>) -> Self {
        Self {
            plan,
            fabric,
            clock: default_clock,
        }
    }

    pub fn with_clock(mut self, clock: ClockFactory) -> Self {
        self.clock = clock;
        self
    }

    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    /// Run every rank to completion; the first failing rank aborts the others
    pub async fn run(self, logger: &Logger) -> Result<ClusterReport> {
        let plan = self.plan;
        if !plan.transport.is_in_process() {
            return Err(AppError::config(format!(
                "The {} transport cannot run as a local cluster",
                plan.transport
            )));
        }
        if self.fabric.num_ranks() != plan.num_ranks() {
            return Err(AppError::internal(format!(
                "fabric has {} ranks, topology maps {}",
                self.fabric.num_ranks(),
                plan.num_ranks()
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let errors = ErrorEventLogger::new(logger.clone());

        let mut clock_name = "";
        let mut tasks = JoinSet::new();
        for rank in 0..plan.num_ranks() {
            let rank_logger = logger.for_rank(rank).await;
            let port = self.fabric.attach(rank)?;
            let mut transport = local_transport(plan.transport, port, plan.policy, &rank_logger)?;
            let mut engine = Engine::new(
                plan.test,
                Arc::clone(&plan.topology),
                plan.layout,
                (self.clock)(),
                &rank_logger,
            );
            clock_name = engine.clock_name();
            tasks.spawn(async move { engine.run(transport.as_mut()).await });
        }

        let mut reports: Vec<RankReport> = Vec::with_capacity(plan.num_ranks());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(AppError::from).and_then(|result| result);
            match outcome {
                Ok(report) => reports.push(report),
                Err(error) => {
                    tasks.abort_all();
                    errors.log_error(&error, Some("local cluster"), None).await;
                    return Err(error);
                }
            }
        }

        ClusterReport::from_ranks(
            session_id,
            started_at,
            started.elapsed().as_millis() as u64,
            plan.transport,
            clock_name.to_string(),
            plan.test,
            plan.topology.as_ref().clone(),
            reports,
            HistogramSet::new(plan.layout),
        )
    }
}

/// The rank of this process in a TCP job
pub struct TcpRank {
    pub rank: usize,
    pub peers: Vec<String>,
    /// Node id announced to the peers
    pub node_id: NodeId,
    /// Mapping that overrides the node ids learned from the peers
    pub topology: Option<RankTopology>,
    pub test: TestConfig,
    pub layout: BinLayout,
    pub policy: RetryPolicy,
    pub backoff: BackoffPolicy,
}

impl TcpRank {
    /// Connect, measure and gather; only rank 0 returns a report
    pub async fn run(self, logger: &Logger) -> Result<Option<ClusterReport>> {
        let session_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let rank_logger = logger.for_rank(self.rank).await;

        let mut transport = TcpTransport::connect(
            self.rank,
            &self.peers,
            self.node_id,
            self.policy,
            &self.backoff,
            &rank_logger,
        )
        .await?;

        let topology = match self.topology {
            Some(topology) => topology,
            None => transport.topology()?,
        };
        let topology = Arc::new(topology);

        let mut engine = Engine::new(
            self.test,
            Arc::clone(&topology),
            self.layout,
            default_clock(),
            &rank_logger,
        );
        let clock_name = engine.clock_name();
        let report = match engine.run(&mut transport).await {
            Ok(report) => report,
            Err(error) => {
                ErrorEventLogger::new(rank_logger)
                    .log_error(&error, Some("tcp rank"), None)
                    .await;
                return Err(error);
            }
        };

        let Some(reports) = transport.gather_reports(report).await? else {
            return Ok(None);
        };

        ClusterReport::from_ranks(
            session_id,
            started_at,
            started.elapsed().as_millis() as u64,
            TransportKind::Tcp,
            clock_name.to_string(),
            self.test,
            topology.as_ref().clone(),
            reports,
            HistogramSet::new(self.layout),
        )
        .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::LatencyVariable;
    use crate::timer::StepClock;
    use std::time::Duration;

    fn step_clock() -> Box<dyn Clock> {
        Box::new(StepClock::new(250))
    }

    fn plan(transport: TransportKind, node_ids: Vec<NodeId>, num_messages: usize) -> RunPlan {
        let topology = RankTopology::from_node_ids(node_ids).unwrap();
        RunPlan {
            transport,
            test: TestConfig {
                num_cycles: 1,
                num_stages: crate::schedule::ceil_pow2(topology.num_ranks()),
                num_messages,
                num_warmup: 1,
                message_size: 16,
            },
            topology: Arc::new(topology),
            layout: BinLayout::default(),
            policy: RetryPolicy::bounded(None, Duration::from_secs(10)),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_rank_cluster() {
        let report = LocalCluster::new(plan(TransportKind::TwoSided, vec![0, 1], 20))
            .with_clock(step_clock)
            .run(&Logger::silent("TEST"))
            .await
            .unwrap();

        assert_eq!(report.num_ranks, 2);
        assert_eq!(report.clock, "step");
        assert_eq!(report.pairings_measured(), 2);
        assert_eq!(report.histograms.total(LatencyVariable::OffNodeOnesided), 40);
        assert_eq!(report.histograms.total(LatencyVariable::OffNodePairwiseMinimum), 2);
        assert_eq!(report.histograms.total(LatencyVariable::OnNodeOnesided), 0);
    }

    #[tokio::test]
    async fn test_local_cluster_rejects_tcp() {
        let result = LocalCluster::new(plan(TransportKind::Tcp, vec![0, 1], 1))
            .run(&Logger::silent("TEST"))
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resource_failure_aborts_run() {
        let plan = plan(TransportKind::Rdma, vec![0, 0], 5);
        let fabric = LocalFabric::with_registration_limit(2, 1);
        let result = LocalCluster::with_fabric(plan, fabric)
            .with_clock(step_clock)
            .run(&Logger::silent("TEST"))
            .await;
        assert!(matches!(result, Err(AppError::Resource { .. })));
    }
}
