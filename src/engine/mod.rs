//! Measurement engine
//!
//! This module contains the per-rank orchestration of a run:
//! - Timer calibration and the initial global barrier
//! - Exchange buffer allocation and release
//! - The cycle and stage loop driven by the XOR schedule
//! - Dispatch of each pairing's samples to the histogram aggregator

pub mod kernel;

pub use kernel::measure_pairing;

use crate::error::{AppError, Result};
use crate::histogram::{Aggregator, BinLayout};
use crate::logging::{Logger, MeasurementLogger};
use crate::models::{RankReport, TestConfig};
use crate::schedule::{StageScheduler, StageStep};
use crate::timer::Clock;
use crate::topology::RankTopology;
use crate::transport::{ExchangeBuffer, Transport};
use std::sync::Arc;
use std::time::Instant;

/// Running counts of one rank's stage loop
#[derive(Debug, Default, Clone, Copy)]
struct StageTally {
    measured: usize,
    skipped: usize,
}

/// Drives one rank through all cycles and stages
pub struct Engine {
    test: TestConfig,
    topology: Arc<RankTopology>,
    layout: BinLayout,
    clock: Box<dyn Clock>,
    logger: MeasurementLogger,
}

impl Engine {
    pub fn new(
        test: TestConfig,
        topology: Arc<RankTopology>,
        layout: BinLayout,
        clock: Box<dyn Clock>,
        logger: &Logger,
    ) -> Self {
        Self {
            test,
            topology,
            layout,
            clock,
            logger: MeasurementLogger::new(logger.clone()),
        }
    }

    pub fn test_config(&self) -> &TestConfig {
        &self.test
    }

    pub fn clock_name(&self) -> &'static str {
        self.clock.name()
    }

    /// Run every cycle and stage for the transport's rank
    pub async fn run(&mut self, transport: &mut dyn Transport) -> Result<RankReport> {
        let started = Instant::now();
        let rank = transport.rank();
        let num_ranks = transport.num_ranks();

        if self.topology.num_ranks() != num_ranks {
            return Err(AppError::config(format!(
                "Topology maps {} ranks but the transport connects {}",
                self.topology.num_ranks(),
                num_ranks
            )));
        }
        self.test.validate(num_ranks)?;

        self.clock.calibrate();
        transport.barrier().await?;

        let mut buffer = transport.allocate(self.test.message_size).await?;
        let mut aggregator = Aggregator::new(self.layout);
        let outcome = self.run_stages(transport, &mut buffer, &mut aggregator).await;
        let released = transport.release(buffer).await;

        let tally = outcome?;
        released?;

        aggregator.finalize();
        let report = RankReport {
            rank,
            pairings_measured: tally.measured,
            pairings_skipped: tally.skipped,
            dropped_samples: aggregator.dropped_samples(),
            histograms: aggregator.into_histograms(),
        };

        self.logger
            .log_rank_summary(report.pairings_measured, report.pairings_skipped, report.dropped_samples, started.elapsed())
            .await;
        Ok(report)
    }

    async fn run_stages(
        &self,
        transport: &mut dyn Transport,
        buffer: &mut ExchangeBuffer,
        aggregator: &mut Aggregator,
    ) -> Result<StageTally> {
        let rank = transport.rank();
        let scheduler = StageScheduler::new(rank, transport.num_ranks(), self.test.num_stages, self.test.num_cycles);
        let stage_barrier = transport.requires_stage_barrier();
        let mut tally = StageTally::default();

        for step in scheduler.pairings() {
            if stage_barrier {
                transport.barrier().await?;
            }

            let Some(peer) = step.partner else {
                tally.skipped += 1;
                self.logger.log_stage_skipped(step.cycle, step.stage).await;
                continue;
            };

            let operation = format!("pairing with rank {}", peer);
            let correlation_id = self.logger.start_operation(&operation).await;
            let outcome = self.run_pairing(transport, buffer, aggregator, step, peer).await;
            self.logger.end_operation(&correlation_id, &operation, outcome.is_ok()).await;
            outcome?;
            tally.measured += 1;
        }

        Ok(tally)
    }

    async fn run_pairing(
        &self,
        transport: &mut dyn Transport,
        buffer: &mut ExchangeBuffer,
        aggregator: &mut Aggregator,
        step: StageStep,
        peer: usize,
    ) -> Result<()> {
        let rank = transport.rank();
        transport.begin_pairing(buffer, peer).await?;
        let samples = measure_pairing(transport, buffer, peer, self.clock.as_ref(), &self.test).await?;
        transport.end_pairing(buffer, peer).await?;

        let locality = self.topology.locality(rank, peer);
        let stats = aggregator.record_pairing(&samples, locality)?;

        self.logger
            .log_pairing_complete(step.cycle, step.stage, peer, self.topology.is_local(rank, peer), &stats)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryPolicy;
    use crate::histogram::LatencyVariable;
    use crate::timer::StepClock;
    use crate::transport::{LocalFabric, MessagePassingTransport};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Clock whose third one-sided interval runs backwards
    struct GlitchClock {
        reads: AtomicU64,
    }

    impl Clock for GlitchClock {
        fn calibrate(&mut self) {}

        fn read(&self) -> u64 {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            // Reads come in (t1, t2, t3) triples; t3 of the third triple jumps back.
            if n == 8 {
                0
            } else {
                1_000 + n * 1_000
            }
        }

        fn seconds(&self, start: u64, end: u64) -> f64 {
            (end as f64 - start as f64) / 1e9
        }

        fn name(&self) -> &'static str {
            "glitch"
        }
    }

    fn test_config(num_messages: usize) -> TestConfig {
        TestConfig {
            num_cycles: 1,
            num_stages: 2,
            num_messages,
            num_warmup: 0,
            message_size: 8,
        }
    }

    async fn run_pair(clocks: [Box<dyn Clock>; 2], test: TestConfig) -> (RankReport, RankReport) {
        let fabric = LocalFabric::new(2);
        let topology = Arc::new(RankTopology::from_node_ids(vec![0, 0]).unwrap());
        let policy = RetryPolicy::bounded(None, Duration::from_secs(5));
        let logger = Logger::silent("TEST");

        let [c0, c1] = clocks;
        let mut e0 = Engine::new(test, Arc::clone(&topology), BinLayout::default(), c0, &logger);
        let mut e1 = Engine::new(test, topology, BinLayout::default(), c1, &logger);
        let mut t0 = MessagePassingTransport::new(fabric.attach(0).unwrap(), policy);
        let mut t1 = MessagePassingTransport::new(fabric.attach(1).unwrap(), policy);

        let (r0, r1) = tokio::join!(e0.run(&mut t0), e1.run(&mut t1));
        (r0.unwrap(), r1.unwrap())
    }

    #[tokio::test]
    async fn test_two_rank_run() {
        let (r0, r1) = run_pair([Box::new(StepClock::new(50)) as Box<dyn Clock>, Box::new(StepClock::new(50))], test_config(10)).await;

        for report in [&r0, &r1] {
            assert_eq!(report.pairings_measured, 1);
            assert_eq!(report.pairings_skipped, 1);
            assert_eq!(report.dropped_samples, 0);
            assert_eq!(report.histograms.total(LatencyVariable::Timer), 10);
            assert_eq!(report.histograms.total(LatencyVariable::OnNodeOnesided), 10);
            assert_eq!(report.histograms.total(LatencyVariable::OnNodePairwise), 10);
            assert_eq!(report.histograms.total(LatencyVariable::OnNodeOnesidedMinimum), 1);
            assert_eq!(report.histograms.total(LatencyVariable::OffNodeOnesided), 0);
        }
        assert_eq!(r0.rank, 0);
        assert_eq!(r1.rank, 1);
    }

    #[tokio::test]
    async fn test_pairings_run_as_correlated_operations() {
        let fabric = LocalFabric::new(2);
        let topology = Arc::new(RankTopology::from_node_ids(vec![0, 1]).unwrap());
        let policy = RetryPolicy::bounded(None, Duration::from_secs(5));
        let l0 = Logger::silent("TEST");
        let l1 = Logger::silent("TEST");
        let outer = l0.start_operation("run").await;

        let mut e0 = Engine::new(test_config(3), Arc::clone(&topology), BinLayout::default(), Box::new(StepClock::new(50)), &l0);
        let mut e1 = Engine::new(test_config(3), topology, BinLayout::default(), Box::new(StepClock::new(50)), &l1);
        let mut t0 = MessagePassingTransport::new(fabric.attach(0).unwrap(), policy);
        let mut t1 = MessagePassingTransport::new(fabric.attach(1).unwrap(), policy);
        let (r0, r1) = tokio::join!(e0.run(&mut t0), e1.run(&mut t1));
        assert_eq!(r0.unwrap().pairings_measured, 1);
        assert_eq!(r1.unwrap().pairings_measured, 1);

        // The pairing replaced the outer id and cleared its own on completion.
        assert_ne!(l0.current_correlation_id().await, Some(outer));
        assert_eq!(l0.current_correlation_id().await, None);
        assert_eq!(l1.current_correlation_id().await, None);
    }

    #[tokio::test]
    async fn test_negative_interval_is_dropped_not_binned() {
        let glitch = GlitchClock {
            reads: AtomicU64::new(0),
        };
        let (r0, r1) = run_pair([Box::new(glitch) as Box<dyn Clock>, Box::new(StepClock::new(1_000))], test_config(5)).await;

        // Rank 0 lost one one-sided sample, so both ranks lose that pairwise sample.
        assert_eq!(r0.histograms.total(LatencyVariable::OnNodeOnesided), 4);
        assert_eq!(r0.histograms.total(LatencyVariable::OnNodePairwise), 4);
        assert_eq!(r0.dropped_samples, 2);
        assert_eq!(r1.histograms.total(LatencyVariable::OnNodeOnesided), 5);
        assert_eq!(r1.histograms.total(LatencyVariable::OnNodePairwise), 4);
        assert_eq!(r1.dropped_samples, 1);

        // The minimum histogram gets exactly one increment, at the 1us bin.
        let layout = BinLayout::default();
        let minimum = r0.histograms.get(LatencyVariable::OnNodeOnesidedMinimum);
        assert_eq!(minimum.total(), 1);
        assert_eq!(minimum.count(layout.time_to_bin(1e-6).unwrap()), 1);
    }

    #[tokio::test]
    async fn test_topology_mismatch_rejected() {
        let fabric = LocalFabric::new(2);
        let topology = Arc::new(RankTopology::from_node_ids(vec![0, 0, 1]).unwrap());
        let mut engine = Engine::new(
            test_config(1),
            topology,
            BinLayout::default(),
            Box::new(StepClock::new(1)),
            &Logger::silent("TEST"),
        );
        let mut transport = MessagePassingTransport::new(
            fabric.attach(0).unwrap(),
            RetryPolicy::bounded(None, Duration::from_millis(100)),
        );
        assert!(matches!(engine.run(&mut transport).await, Err(AppError::Config(_))));
    }
}
