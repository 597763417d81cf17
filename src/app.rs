//! Main application orchestration and execution

use crate::{
    cli::Cli,
    cluster::{LocalCluster, RunPlan, TcpRank},
    config::{display_config_summary, load_config, validate_config, EnvManager},
    error::{AppError, BackoffPolicy, Result},
    logging::{Logger, LoggerFactory},
    models::{ClusterReport, Config},
    output::OutputCoordinator,
    topology::{local_node_id, RankTopology},
    types::TransportKind,
};
use std::sync::Arc;

/// Main application struct that coordinates all components
pub struct App {
    cli: Cli,
}

impl App {
    /// Create a new application instance with CLI configuration
    pub fn new(cli: Cli) -> Result<Self> {
        cli.validate().map_err(AppError::config)?;
        Ok(Self { cli })
    }

    /// Run the application
    pub async fn run(self) -> Result<()> {
        if self.cli.env_help {
            print!("{}", EnvManager::display_env_help());
            return Ok(());
        }

        let config = load_config(self.cli)?;
        let output = OutputCoordinator::from_config(&config);

        let warnings = validate_config(&config)?;
        for warning in &warnings {
            eprintln!("{}", warning.format(config.enable_color));
        }
        if let Some(fatal) = warnings.iter().find(|w| w.is_error()) {
            return Err(AppError::config(fatal.message.clone()));
        }

        let factory = LoggerFactory::new(config.clone());
        let logger = factory.create_logger("PLT").await;
        logger
            .add_context_field("transport".to_string(), config.transport.as_str())
            .await;
        if config.debug {
            eprintln!(
                "{} v{} ({}, commit {}, built {})",
                crate::PKG_NAME,
                crate::VERSION,
                env!("TARGET_TRIPLE"),
                option_env!("GIT_COMMIT").unwrap_or("unknown"),
                env!("BUILD_TIME")
            );
            eprintln!("{}", display_config_summary(&config));
        }

        let report = match config.transport {
            TransportKind::Tcp => run_tcp_rank(&config, &output, &logger).await?,
            _ => Some(run_local_cluster(&config, &output, &logger).await?),
        };

        if let Some(report) = report {
            let dropped = report.dropped_samples();
            if dropped > 0 {
                output.emit_warning(&format!(
                    "{} samples were dropped as invalid and are missing from the histograms",
                    dropped
                ));
            }
            output.emit_report(&report).await?;
        }

        Ok(())
    }
}

/// Run every rank of the job inside this process
async fn run_local_cluster(config: &Config, output: &OutputCoordinator, logger: &Logger) -> Result<ClusterReport> {
    let topology = match config.explicit_topology()? {
        Some(topology) => topology,
        None => RankTopology::single_node(config.world_size())?,
    };
    if config.show_mapping {
        output.emit_mapping(&topology)?;
    }

    let plan = RunPlan {
        transport: config.transport,
        test: config.test_config(),
        topology: Arc::new(topology),
        layout: config.bin_layout()?,
        policy: config.retry_policy(),
    };

    crate::log_info!(
        logger,
        "Starting {} ranks over the {} transport",
        plan.num_ranks(),
        plan.transport
    );

    crate::log_debug!(logger, "Resolved test parameters: {:?}", plan.test);

    LocalCluster::new(plan).run(logger).await
}

/// Run this process's rank of a TCP job; only rank 0 returns a report
async fn run_tcp_rank(config: &Config, output: &OutputCoordinator, logger: &Logger) -> Result<Option<ClusterReport>> {
    let rank = config
        .rank
        .ok_or_else(|| AppError::config("The tcp transport needs --rank"))?;
    let topology = config.explicit_topology()?;
    let node_id = match topology.as_ref().and_then(|t| t.node_id(rank)) {
        Some(node_id) => node_id,
        None => local_node_id()?,
    };

    let job = TcpRank {
        rank,
        peers: config.peers.clone(),
        node_id,
        topology,
        test: config.test_config(),
        layout: config.bin_layout()?,
        policy: config.retry_policy(),
        backoff: BackoffPolicy::default(),
    };

    logger
        .info(&format!(
            "Rank {} of {} joining as node {}",
            rank,
            config.peers.len(),
            node_id
        ))
        .log()
        .await;

    crate::log_debug!(logger, "Resolved test parameters: {:?}", job.test);

    let report = job.run(logger).await?;
    if let Some(report) = &report {
        if config.show_mapping {
            output.emit_mapping(&report.topology)?;
        }
    }
    Ok(report)
}
