//! Core formatting traits and implementations
//!
//! This module defines the report formatting interface and provides a text
//! implementation with table formatting and a JSON implementation.

use crate::{
    error::{AppError, Result},
    histogram::{BinCount, HistogramSummary},
    models::{ClusterReport, RankReport, TestConfig},
    topology::RankTopology,
    types::TransportKind,
};
use chrono::{DateTime, Utc};
use colored::*;
use serde::Serialize;
use std::fmt::Write as _;

/// Main trait for report formatting
pub trait OutputFormatter: Send + Sync {
    /// Format a complete run report
    fn format_report(&self, report: &ClusterReport) -> Result<String>;

    /// Format the rank to node mapping
    fn format_mapping(&self, topology: &RankTopology) -> Result<String>;

    /// Format warning messages
    fn format_warning(&self, warning: &str) -> String;
}

/// Configuration options for formatting
#[derive(Debug, Clone)]
pub struct FormattingOptions {
    /// Enable colored output
    pub enable_color: bool,
    /// List the non-empty bins of every histogram
    pub show_bins: bool,
    /// Show the per-rank breakdown
    pub show_ranks: bool,
}

impl Default for FormattingOptions {
    fn default() -> Self {
        Self {
            enable_color: true,
            show_bins: true,
            show_ranks: false,
        }
    }
}

/// Text alignment options
#[derive(Debug, Clone, Copy)]
pub enum Alignment {
    Left,
    Right,
}

/// Column definition for table formatting
#[derive(Debug, Clone)]
pub struct Column {
    pub header: &'static str,
    pub alignment: Alignment,
}

impl Column {
    fn left(header: &'static str) -> Self {
        Self {
            header,
            alignment: Alignment::Left,
        }
    }

    fn right(header: &'static str) -> Self {
        Self {
            header,
            alignment: Alignment::Right,
        }
    }
}

/// Row data for table formatting
pub type RowData = Vec<String>;

/// Human-readable text formatter
pub struct TextFormatter {
    options: FormattingOptions,
}

impl TextFormatter {
    pub fn new(options: FormattingOptions) -> Self {
        Self { options }
    }

    fn heading(&self, title: &str) -> String {
        let border = "=".repeat(title.len() + 4);
        if self.options.enable_color {
            format!("{}\n  {}  \n{}", border.cyan(), title.bold().cyan(), border.cyan())
        } else {
            format!("{}\n  {}  \n{}", border, title, border)
        }
    }

    fn subheading(&self, title: &str) -> String {
        let underline = "-".repeat(title.len());
        if self.options.enable_color {
            format!("{}\n{}", title.bold(), underline)
        } else {
            format!("{}\n{}", title, underline)
        }
    }

    /// Create a bordered table from column definitions and rows
    fn create_table(&self, columns: &[Column], rows: &[RowData]) -> String {
        let widths: Vec<usize> = columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                rows.iter()
                    .filter_map(|row| row.get(index))
                    .map(|cell| cell.chars().count())
                    .max()
                    .unwrap_or(0)
                    .max(column.header.len())
            })
            .collect();

        let border = create_horizontal_border(&widths);
        let headers: RowData = columns.iter().map(|c| c.header.to_string()).collect();

        let mut output = String::new();
        output.push_str(&border);
        output.push('\n');
        output.push_str(&create_row(&headers, &widths, columns));
        output.push('\n');
        output.push_str(&border);
        output.push('\n');
        for row in rows {
            output.push_str(&create_row(row, &widths, columns));
            output.push('\n');
        }
        output.push_str(&border);
        output
    }

    fn format_run_summary(&self, report: &ClusterReport) -> Result<String> {
        let mut output = String::new();
        let test = &report.test;

        writeln!(output, "{}", self.subheading("Run Summary")).map_err(fmt_error)?;
        writeln!(output, "Session:          {}", report.session_id).map_err(fmt_error)?;
        writeln!(output, "Started:          {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC")).map_err(fmt_error)?;
        writeln!(output, "Duration:         {}", format_duration_ms(report.duration_ms)).map_err(fmt_error)?;
        writeln!(output, "Transport:        {}", report.transport).map_err(fmt_error)?;
        writeln!(output, "Clock:            {}", report.clock).map_err(fmt_error)?;
        writeln!(
            output,
            "Ranks:            {} on {} node(s)",
            report.num_ranks,
            report.topology.num_nodes()
        )
        .map_err(fmt_error)?;
        writeln!(
            output,
            "Schedule:         {} cycle(s) x {} stage(s)",
            test.num_cycles, test.num_stages
        )
        .map_err(fmt_error)?;
        writeln!(
            output,
            "Messages:         {} timed, {} warm-up, {} bytes",
            test.num_messages, test.num_warmup, test.message_size
        )
        .map_err(fmt_error)?;
        writeln!(output, "Pairings:         {}", report.pairings_measured()).map_err(fmt_error)?;

        let dropped = report.dropped_samples();
        let dropped_line = format!("Dropped samples:  {}", dropped);
        if dropped > 0 && self.options.enable_color {
            write!(output, "{}", dropped_line.yellow()).map_err(fmt_error)?;
        } else {
            write!(output, "{}", dropped_line).map_err(fmt_error)?;
        }

        Ok(output)
    }

    fn format_summary_table(&self, summaries: &[HistogramSummary]) -> String {
        let columns = [
            Column::left("Histogram"),
            Column::right("Count"),
            Column::right("Min"),
            Column::right("Median"),
            Column::right("P99"),
            Column::right("Max"),
        ];
        let rows: Vec<RowData> = summaries
            .iter()
            .map(|s| {
                vec![
                    s.label().to_string(),
                    s.count.to_string(),
                    format_optional_seconds(s.min_seconds),
                    format_optional_seconds(s.p50_seconds),
                    format_optional_seconds(s.p99_seconds),
                    format_optional_seconds(s.max_seconds),
                ]
            })
            .collect();

        format!("{}\n{}", self.subheading("Latency Histograms"), self.create_table(&columns, &rows))
    }

    fn format_rank_table(&self, ranks: &[RankReport]) -> String {
        let columns = [
            Column::right("Rank"),
            Column::right("Measured"),
            Column::right("Skipped"),
            Column::right("Dropped"),
        ];
        let rows: Vec<RowData> = ranks
            .iter()
            .map(|r| {
                vec![
                    r.rank.to_string(),
                    r.pairings_measured.to_string(),
                    r.pairings_skipped.to_string(),
                    r.dropped_samples.to_string(),
                ]
            })
            .collect();

        format!("{}\n{}", self.subheading("Ranks"), self.create_table(&columns, &rows))
    }

    fn format_bins(&self, report: &ClusterReport) -> Result<String> {
        let layout = report.histograms.layout();
        let mut output = String::new();
        write!(output, "{}", self.subheading("Non-empty Bins")).map_err(fmt_error)?;

        for (variable, histogram) in report.histograms.iter() {
            let bins = histogram.non_empty_bins(layout);
            if bins.is_empty() {
                continue;
            }
            let label = if self.options.enable_color {
                variable.label().green().to_string()
            } else {
                variable.label().to_string()
            };
            write!(output, "\n# {}", label).map_err(fmt_error)?;
            for bin in bins {
                write!(
                    output,
                    "\n  [{:>10}, {:>10})  {}",
                    format_seconds(bin.lower_seconds),
                    format_seconds(bin.upper_seconds),
                    bin.count
                )
                .map_err(fmt_error)?;
            }
        }

        Ok(output)
    }
}

impl OutputFormatter for TextFormatter {
    fn format_report(&self, report: &ClusterReport) -> Result<String> {
        let mut sections = vec![
            self.heading("Pairwise Latency Results"),
            self.format_run_summary(report)?,
            self.format_summary_table(&report.summaries()),
        ];
        if self.options.show_ranks {
            sections.push(self.format_rank_table(&report.ranks));
        }
        if self.options.show_bins {
            sections.push(self.format_bins(report)?);
        }
        Ok(sections.join("\n\n"))
    }

    fn format_mapping(&self, topology: &RankTopology) -> Result<String> {
        Ok(topology.mapping_listing())
    }

    fn format_warning(&self, warning: &str) -> String {
        if self.options.enable_color {
            format!("{} {}", "Warning:".yellow().bold(), warning)
        } else {
            format!("Warning: {}", warning)
        }
    }
}

/// Machine-readable JSON formatter
pub struct JsonFormatter;

#[derive(Serialize)]
struct JsonHistogram<'a> {
    label: &'static str,
    #[serde(flatten)]
    summary: &'a HistogramSummary,
    bins: Vec<BinCount>,
}

#[derive(Serialize)]
struct JsonLayout {
    min_seconds: f64,
    max_seconds: f64,
    bins_per_decade: u32,
    num_bins: usize,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    session_id: &'a str,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    transport: TransportKind,
    clock: &'a str,
    num_ranks: usize,
    node_ids: &'a [crate::types::NodeId],
    test: &'a TestConfig,
    pairings_measured: usize,
    dropped_samples: u64,
    ranks: &'a [RankReport],
    layout: JsonLayout,
    histograms: Vec<JsonHistogram<'a>>,
}

impl OutputFormatter for JsonFormatter {
    fn format_report(&self, report: &ClusterReport) -> Result<String> {
        let layout = report.histograms.layout();
        let summaries = report.summaries();
        let histograms = report
            .histograms
            .iter()
            .zip(&summaries)
            .map(|((variable, histogram), summary)| JsonHistogram {
                label: variable.label(),
                summary,
                bins: histogram.non_empty_bins(layout),
            })
            .collect();

        let json = JsonReport {
            session_id: &report.session_id,
            started_at: report.started_at,
            duration_ms: report.duration_ms,
            transport: report.transport,
            clock: &report.clock,
            num_ranks: report.num_ranks,
            node_ids: report.topology.node_ids(),
            test: &report.test,
            pairings_measured: report.pairings_measured(),
            dropped_samples: report.dropped_samples(),
            ranks: &report.ranks,
            layout: JsonLayout {
                min_seconds: layout.min_seconds(),
                max_seconds: layout.max_seconds(),
                bins_per_decade: layout.bins_per_decade(),
                num_bins: layout.num_bins(),
            },
            histograms,
        };

        Ok(serde_json::to_string_pretty(&json)?)
    }

    fn format_mapping(&self, topology: &RankTopology) -> Result<String> {
        Ok(topology.mapping_listing())
    }

    fn format_warning(&self, warning: &str) -> String {
        format!("Warning: {}", warning)
    }
}

fn fmt_error(e: std::fmt::Error) -> AppError {
    AppError::io(format!("Failed to format report: {}", e))
}

/// Create a table row
fn create_row(data: &[String], widths: &[usize], columns: &[Column]) -> String {
    let mut row = String::from("|");
    for ((cell, &width), column) in data.iter().zip(widths).zip(columns) {
        row.push(' ');
        row.push_str(&align_text(cell, width, column.alignment));
        row.push_str(" |");
    }
    row
}

/// Create horizontal border for table
fn create_horizontal_border(widths: &[usize]) -> String {
    let mut border = String::from("+");
    for &width in widths {
        border.push_str(&"-".repeat(width + 2));
        border.push('+');
    }
    border
}

/// Align text within specified width
fn align_text(text: &str, width: usize, alignment: Alignment) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    let padding = width - len;
    match alignment {
        Alignment::Left => format!("{}{}", text, " ".repeat(padding)),
        Alignment::Right => format!("{}{}", " ".repeat(padding), text),
    }
}

/// Format a duration in seconds with a unit suited to its magnitude
pub fn format_seconds(seconds: f64) -> String {
    if !seconds.is_finite() {
        "inf".to_string()
    } else if seconds == 0.0 {
        "0".to_string()
    } else if seconds < 1e-6 {
        format!("{:.1}ns", seconds * 1e9)
    } else if seconds < 1e-3 {
        format!("{:.2}us", seconds * 1e6)
    } else if seconds < 1.0 {
        format!("{:.2}ms", seconds * 1e3)
    } else {
        format!("{:.2}s", seconds)
    }
}

fn format_optional_seconds(seconds: Option<f64>) -> String {
    seconds.map(format_seconds).unwrap_or_else(|| "-".to_string())
}

fn format_duration_ms(duration_ms: u64) -> String {
    if duration_ms < 1000 {
        format!("{}ms", duration_ms)
    } else if duration_ms < 60_000 {
        format!("{:.2}s", duration_ms as f64 / 1000.0)
    } else {
        format!("{}m{:.1}s", duration_ms / 60_000, (duration_ms % 60_000) as f64 / 1000.0)
    }
}
