//! Per-histogram summary statistics
//!
//! Values are read off bin edges, so they are only as precise as the layout.

use super::{BinLayout, Histogram, LatencyVariable};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub variable: LatencyVariable,
    pub count: u64,
    /// Lower edge of the lowest non-empty bin
    pub min_seconds: Option<f64>,
    pub p50_seconds: Option<f64>,
    pub p99_seconds: Option<f64>,
    /// Upper edge of the highest non-empty bin (lower edge for the overflow bin)
    pub max_seconds: Option<f64>,
    /// Lower edge of the most populated bin
    pub mode_seconds: Option<f64>,
}

impl HistogramSummary {
    pub fn from_histogram(variable: LatencyVariable, histogram: &Histogram, layout: &BinLayout) -> Self {
        let counts = histogram.counts();
        let count = histogram.total();

        let first = counts.iter().position(|&c| c > 0);
        let last = counts.iter().rposition(|&c| c > 0);
        let mode = counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map(|(index, _)| index);

        let max_seconds = last.map(|index| {
            let upper = layout.bin_upper_bound(index);
            if upper.is_finite() {
                upper
            } else {
                layout.bin_lower_bound(index)
            }
        });

        Self {
            variable,
            count,
            min_seconds: first.map(|index| layout.bin_lower_bound(index)),
            p50_seconds: quantile_bin(counts, count, 0.50).map(|index| layout.bin_lower_bound(index)),
            p99_seconds: quantile_bin(counts, count, 0.99).map(|index| layout.bin_lower_bound(index)),
            max_seconds,
            mode_seconds: mode.map(|index| layout.bin_lower_bound(index)),
        }
    }

    pub fn label(&self) -> &'static str {
        self.variable.label()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Index of the bin holding the sample of rank `ceil(q * total)`
fn quantile_bin(counts: &[u64], total: u64, q: f64) -> Option<usize> {
    if total == 0 {
        return None;
    }
    let target = ((q * total as f64).ceil() as u64).clamp(1, total);
    let mut seen = 0;
    for (index, &c) in counts.iter().enumerate() {
        seen += c;
        if seen >= target {
            return Some(index);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Aggregator;

    #[test]
    fn test_empty_summary() {
        let layout = BinLayout::default();
        let histogram = Histogram::new(layout.num_bins());
        let summary = HistogramSummary::from_histogram(LatencyVariable::Timer, &histogram, &layout);
        assert!(summary.is_empty());
        assert_eq!(summary.min_seconds, None);
        assert_eq!(summary.p50_seconds, None);
        assert_eq!(summary.label(), "timer");
    }

    #[test]
    fn test_quantiles_follow_bins() {
        let layout = BinLayout::default();
        let mut aggregator = Aggregator::new(layout);
        for _ in 0..98 {
            aggregator.bin(LatencyVariable::OffNodeOnesided, 1e-6).unwrap();
        }
        aggregator.bin(LatencyVariable::OffNodeOnesided, 1e-4).unwrap();
        aggregator.bin(LatencyVariable::OffNodeOnesided, 1e-2).unwrap();

        let summary = &aggregator.histograms().summaries()[5];
        assert_eq!(summary.variable, LatencyVariable::OffNodeOnesided);
        assert_eq!(summary.count, 100);

        let low_bin = layout.time_to_bin(1e-6).unwrap();
        assert_eq!(summary.p50_seconds, Some(layout.bin_lower_bound(low_bin)));
        assert_eq!(summary.mode_seconds, Some(layout.bin_lower_bound(low_bin)));
        assert_eq!(summary.min_seconds, Some(layout.bin_lower_bound(low_bin)));

        let p99_bin = layout.time_to_bin(1e-4).unwrap();
        assert_eq!(summary.p99_seconds, Some(layout.bin_lower_bound(p99_bin)));

        let max = summary.max_seconds.unwrap();
        assert!(max > 1e-2);
    }

    #[test]
    fn test_overflow_max_is_finite() {
        let layout = BinLayout::default();
        let mut aggregator = Aggregator::new(layout);
        aggregator.bin(LatencyVariable::Timer, 100.0).unwrap();
        let summary = &aggregator.histograms().summaries()[0];
        assert_eq!(summary.max_seconds, Some(layout.max_seconds()));
    }

    #[test]
    fn test_quantile_bin_rank() {
        assert_eq!(quantile_bin(&[0, 2, 2], 4, 0.5), Some(1));
        assert_eq!(quantile_bin(&[0, 2, 2], 4, 0.51), Some(2));
        assert_eq!(quantile_bin(&[0, 0], 0, 0.5), None);
    }
}
