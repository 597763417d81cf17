//! Output formatting and display system
//!
//! This module renders run reports as text tables or JSON and delivers them
//! to stdout or a report file.

mod formatter;

pub use formatter::{
    format_seconds, Alignment, Column, FormattingOptions, JsonFormatter, OutputFormatter, RowData, TextFormatter,
};

use crate::{
    error::{ErrorContext, Result},
    models::{ClusterReport, Config},
    topology::RankTopology,
    types::OutputFormat,
};
use std::path::PathBuf;

/// Output formatting factory for creating appropriate formatters
pub struct OutputFormatterFactory;

impl OutputFormatterFactory {
    /// Create a formatter for the requested format
    pub fn create_formatter(format: OutputFormat, enable_color: bool, verbose: bool) -> Box<dyn OutputFormatter> {
        match format {
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Text => Box::new(TextFormatter::new(FormattingOptions {
                enable_color,
                show_bins: true,
                show_ranks: verbose,
            })),
        }
    }

    /// Create a plain text formatter for scripts/logs
    pub fn create_plain_formatter() -> Box<dyn OutputFormatter> {
        Self::create_formatter(OutputFormat::Text, false, true)
    }
}

/// Main output coordinator that handles all report display
pub struct OutputCoordinator {
    formatter: Box<dyn OutputFormatter>,
    output: Option<PathBuf>,
}

impl OutputCoordinator {
    pub fn new(formatter: Box<dyn OutputFormatter>, output: Option<PathBuf>) -> Self {
        Self { formatter, output }
    }

    /// Coordinator for the configured format, color and destination
    pub fn from_config(config: &Config) -> Self {
        // Colors never go into report files
        let enable_color = config.enable_color && config.output.is_none();
        Self::new(
            OutputFormatterFactory::create_formatter(config.format, enable_color, config.verbose),
            config.output.clone(),
        )
    }

    pub fn formatter(&self) -> &dyn OutputFormatter {
        self.formatter.as_ref()
    }

    /// Render the report without delivering it
    pub fn render_report(&self, report: &ClusterReport) -> Result<String> {
        self.formatter.format_report(report)
    }

    /// Render and deliver the report to the output file or stdout
    pub async fn emit_report(&self, report: &ClusterReport) -> Result<()> {
        let rendered = self.render_report(report)?;
        match &self.output {
            Some(path) => tokio::fs::write(path, format!("{}\n", rendered))
                .await
                .with_context(|| format!("Failed to write report to {}", path.display())),
            None => {
                println!("{}", rendered);
                Ok(())
            }
        }
    }

    /// Print the rank to node mapping
    pub fn emit_mapping(&self, topology: &RankTopology) -> Result<()> {
        print!("{}", self.formatter.format_mapping(topology)?);
        Ok(())
    }

    /// Print a non-fatal warning to stderr
    pub fn emit_warning(&self, warning: &str) {
        eprintln!("{}", self.formatter.format_warning(warning));
    }
}
