//! Latency histograms
//!
//! Every rank owns one [`Aggregator`] holding the nine histograms of a run.
//! Samples arrive one pairing at a time via [`Aggregator::record_pairing`];
//! after the last pairing the aggregator is finalized and its
//! [`HistogramSet`] can be merged with the other ranks' sets.

pub mod summary;

pub use summary::HistogramSummary;

use crate::error::{AppError, Result};
use crate::types::Locality;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default lower edge of the first log-spaced bin, in seconds
pub const DEFAULT_MIN_SECONDS: f64 = 1e-9;
/// Default lower edge of the overflow bin, in seconds
pub const DEFAULT_MAX_SECONDS: f64 = 10.0;
/// Default resolution of the log-spaced bins
pub const DEFAULT_BINS_PER_DECADE: u32 = 50;

/// Log-scaled bin edges shared by every histogram of a run
///
/// Bin 0 holds `[0, min_seconds)`, the last bin holds `[max_seconds, inf)`,
/// and the bins in between split each decade into `bins_per_decade` equal
/// steps on a log scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinLayout {
    min_seconds: f64,
    max_seconds: f64,
    bins_per_decade: u32,
    log_bins: usize,
}

impl Default for BinLayout {
    fn default() -> Self {
        Self {
            min_seconds: DEFAULT_MIN_SECONDS,
            max_seconds: DEFAULT_MAX_SECONDS,
            bins_per_decade: DEFAULT_BINS_PER_DECADE,
            log_bins: 500,
        }
    }
}

impl BinLayout {
    pub fn new(min_seconds: f64, max_seconds: f64, bins_per_decade: u32) -> Result<Self> {
        if !(min_seconds.is_finite() && min_seconds > 0.0) {
            return Err(AppError::histogram(format!("bin minimum must be positive, got {}", min_seconds)));
        }
        if !(max_seconds.is_finite() && max_seconds > min_seconds) {
            return Err(AppError::histogram(format!(
                "bin maximum {} must exceed minimum {}",
                max_seconds, min_seconds
            )));
        }
        if bins_per_decade == 0 {
            return Err(AppError::histogram("bins per decade must be greater than 0"));
        }

        let decades = (max_seconds / min_seconds).log10();
        let steps = decades * f64::from(bins_per_decade);
        // Snap near-integers so 1e-9..10 at 50/decade gives exactly 500 bins.
        let log_bins = if (steps - steps.round()).abs() < 1e-9 {
            steps.round() as usize
        } else {
            steps.ceil() as usize
        };

        Ok(Self {
            min_seconds,
            max_seconds,
            bins_per_decade,
            log_bins: log_bins.max(1),
        })
    }

    /// Default range with a different resolution
    pub fn with_bins_per_decade(bins_per_decade: u32) -> Result<Self> {
        Self::new(DEFAULT_MIN_SECONDS, DEFAULT_MAX_SECONDS, bins_per_decade)
    }

    pub fn min_seconds(&self) -> f64 {
        self.min_seconds
    }

    pub fn max_seconds(&self) -> f64 {
        self.max_seconds
    }

    pub fn bins_per_decade(&self) -> u32 {
        self.bins_per_decade
    }

    /// Total bin count including underflow and overflow
    pub fn num_bins(&self) -> usize {
        self.log_bins + 2
    }

    fn overflow_bin(&self) -> usize {
        self.log_bins + 1
    }

    /// Bin index for a duration in seconds, `None` for negative or NaN values
    pub fn time_to_bin(&self, seconds: f64) -> Option<usize> {
        if seconds.is_nan() || seconds < 0.0 {
            return None;
        }
        if seconds < self.min_seconds {
            return Some(0);
        }
        if seconds >= self.max_seconds {
            return Some(self.overflow_bin());
        }

        let steps = (seconds / self.min_seconds).log10() * f64::from(self.bins_per_decade);
        let index = steps.floor() as usize + 1;
        Some(index.clamp(1, self.log_bins))
    }

    /// Lower edge of bin `index` in seconds
    pub fn bin_lower_bound(&self, index: usize) -> f64 {
        match index {
            0 => 0.0,
            i if i >= self.overflow_bin() => self.max_seconds,
            i => {
                let exponent = (i - 1) as f64 / f64::from(self.bins_per_decade);
                self.min_seconds * 10f64.powf(exponent)
            }
        }
    }

    /// Upper edge of bin `index` in seconds, infinite for the overflow bin
    pub fn bin_upper_bound(&self, index: usize) -> f64 {
        if index >= self.overflow_bin() {
            f64::INFINITY
        } else if index == self.log_bins {
            self.max_seconds
        } else {
            self.bin_lower_bound(index + 1)
        }
    }
}

/// The nine measured quantities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LatencyVariable {
    Timer,
    OnNodeOnesided,
    OnNodePairwise,
    OnNodeOnesidedMinimum,
    OnNodePairwiseMinimum,
    OffNodeOnesided,
    OffNodePairwise,
    OffNodeOnesidedMinimum,
    OffNodePairwiseMinimum,
}

impl LatencyVariable {
    pub const ALL: [LatencyVariable; 9] = [
        Self::Timer,
        Self::OnNodeOnesided,
        Self::OnNodePairwise,
        Self::OnNodeOnesidedMinimum,
        Self::OnNodePairwiseMinimum,
        Self::OffNodeOnesided,
        Self::OffNodePairwise,
        Self::OffNodeOnesidedMinimum,
        Self::OffNodePairwiseMinimum,
    ];

    /// Histogram label as written in reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::OnNodeOnesided => "onNodeOnesided",
            Self::OnNodePairwise => "onNodePairwise",
            Self::OnNodeOnesidedMinimum => "onNodeOnesidedMinimum",
            Self::OnNodePairwiseMinimum => "onNodePairwiseMinimum",
            Self::OffNodeOnesided => "offNodeOnesided",
            Self::OffNodePairwise => "offNodePairwise",
            Self::OffNodeOnesidedMinimum => "offNodeOnesidedMinimum",
            Self::OffNodePairwiseMinimum => "offNodePairwiseMinimum",
        }
    }

    pub fn onesided(locality: Locality) -> Self {
        match locality {
            Locality::OnNode => Self::OnNodeOnesided,
            Locality::OffNode => Self::OffNodeOnesided,
        }
    }

    pub fn pairwise(locality: Locality) -> Self {
        match locality {
            Locality::OnNode => Self::OnNodePairwise,
            Locality::OffNode => Self::OffNodePairwise,
        }
    }

    pub fn onesided_minimum(locality: Locality) -> Self {
        match locality {
            Locality::OnNode => Self::OnNodeOnesidedMinimum,
            Locality::OffNode => Self::OffNodeOnesidedMinimum,
        }
    }

    pub fn pairwise_minimum(locality: Locality) -> Self {
        match locality {
            Locality::OnNode => Self::OnNodePairwiseMinimum,
            Locality::OffNode => Self::OffNodePairwiseMinimum,
        }
    }

    /// True for the once-per-pairing minimum histograms
    pub fn is_minimum(&self) -> bool {
        matches!(
            self,
            Self::OnNodeOnesidedMinimum
                | Self::OnNodePairwiseMinimum
                | Self::OffNodeOnesidedMinimum
                | Self::OffNodePairwiseMinimum
        )
    }
}

impl std::fmt::Display for LatencyVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Counts of one variable over a [`BinLayout`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    counts: Vec<u64>,
}

/// A non-empty bin for reporting
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BinCount {
    pub index: usize,
    pub lower_seconds: f64,
    pub upper_seconds: f64,
    pub count: u64,
}

impl Histogram {
    pub fn new(num_bins: usize) -> Self {
        Self {
            counts: vec![0; num_bins],
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn count(&self, bin: usize) -> u64 {
        self.counts.get(bin).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }

    fn increment(&mut self, bin: usize) {
        if let Some(slot) = self.counts.get_mut(bin) {
            *slot += 1;
        }
    }

    fn merge(&mut self, other: &Histogram) {
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
    }

    /// Bins with at least one sample, in ascending order
    pub fn non_empty_bins(&self, layout: &BinLayout) -> Vec<BinCount> {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(index, &count)| BinCount {
                index,
                lower_seconds: layout.bin_lower_bound(index),
                upper_seconds: layout.bin_upper_bound(index),
                count,
            })
            .collect()
    }
}

/// The nine histograms of one rank or of the whole job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    layout: BinLayout,
    histograms: BTreeMap<LatencyVariable, Histogram>,
}

impl HistogramSet {
    pub fn new(layout: BinLayout) -> Self {
        let histograms = LatencyVariable::ALL
            .iter()
            .map(|&variable| (variable, Histogram::new(layout.num_bins())))
            .collect();
        Self { layout, histograms }
    }

    pub fn layout(&self) -> &BinLayout {
        &self.layout
    }

    pub fn get(&self, variable: LatencyVariable) -> &Histogram {
        // Built by `new` or checked by `validate`, so every variable is present.
        &self.histograms[&variable]
    }

    pub fn total(&self, variable: LatencyVariable) -> u64 {
        self.get(variable).total()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LatencyVariable, &Histogram)> {
        self.histograms.iter().map(|(&variable, histogram)| (variable, histogram))
    }

    fn increment(&mut self, variable: LatencyVariable, bin: usize) {
        if let Some(histogram) = self.histograms.get_mut(&variable) {
            histogram.increment(bin);
        }
    }

    /// Check that all nine variables are present with one count per bin
    ///
    /// Sets built locally always pass. Sets decoded from another rank's report
    /// must be checked before they are read or merged.
    pub fn validate(&self) -> Result<()> {
        let num_bins = self.layout.num_bins();
        for variable in LatencyVariable::ALL {
            let histogram = self
                .histograms
                .get(&variable)
                .ok_or_else(|| AppError::histogram(format!("histogram '{}' is missing", variable.label())))?;
            if histogram.counts.len() != num_bins {
                return Err(AppError::histogram(format!(
                    "histogram '{}' has {} bins, expected {}",
                    variable.label(),
                    histogram.counts.len(),
                    num_bins
                )));
            }
        }
        Ok(())
    }

    /// Add another set's counts into this one
    pub fn merge(&mut self, other: &HistogramSet) -> Result<()> {
        if self.layout != other.layout {
            return Err(AppError::histogram(format!(
                "cannot merge histograms with different bin layouts ({} vs {} bins)",
                self.layout.num_bins(),
                other.layout.num_bins()
            )));
        }
        other.validate()?;
        for (variable, theirs) in &other.histograms {
            if let Some(mine) = self.histograms.get_mut(variable) {
                mine.merge(theirs);
            }
        }
        Ok(())
    }

    /// Summaries of all nine histograms in label order
    pub fn summaries(&self) -> Vec<HistogramSummary> {
        self.iter()
            .map(|(variable, histogram)| HistogramSummary::from_histogram(variable, histogram, &self.layout))
            .collect()
    }
}

/// Samples of one pairing, aligned by iteration index
///
/// `None` marks an invalid sample: a negative or non-finite duration on this
/// side, or on either side for pairwise values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairingSamples {
    pub timer_overhead: Vec<Option<f64>>,
    pub one_sided: Vec<Option<f64>>,
    pub pairwise: Vec<Option<f64>>,
}

/// Keep only non-negative finite durations
pub fn valid_sample(seconds: f64) -> Option<f64> {
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

/// Pairwise latency as the mean of both sides' one-sided latencies
pub fn derive_pairwise(one_sided: &[Option<f64>], peer_one_sided: &[Option<f64>]) -> Vec<Option<f64>> {
    one_sided
        .iter()
        .zip(peer_one_sided)
        .map(|(mine, theirs)| match (mine, theirs) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            _ => None,
        })
        .collect()
}

/// Smallest strictly positive valid value
pub fn positive_minimum(values: &[Option<f64>]) -> Option<f64> {
    values
        .iter()
        .flatten()
        .copied()
        .filter(|&v| v > 0.0)
        .min_by(|a, b| a.total_cmp(b))
}

/// What one pairing contributed
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairingStats {
    pub binned: u64,
    pub dropped: u64,
    pub min_one_sided: Option<f64>,
    pub min_pairwise: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    InProgress,
    Finalized,
}

/// Single writer of a rank's histograms
#[derive(Debug, Clone)]
pub struct Aggregator {
    set: HistogramSet,
    state: AggregatorState,
    dropped: u64,
}

impl Aggregator {
    pub fn new(layout: BinLayout) -> Self {
        Self {
            set: HistogramSet::new(layout),
            state: AggregatorState::InProgress,
            dropped: 0,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// Samples rejected as invalid so far
    pub fn dropped_samples(&self) -> u64 {
        self.dropped
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            AggregatorState::InProgress => Ok(()),
            AggregatorState::Finalized => Err(AppError::histogram("cannot bin samples after the aggregator is finalized")),
        }
    }

    /// Count `seconds` in the histogram for `variable`
    ///
    /// Returns `Ok(false)` without touching any count for negative or NaN values.
    pub fn bin(&mut self, variable: LatencyVariable, seconds: f64) -> Result<bool> {
        self.ensure_open()?;
        match self.set.layout.time_to_bin(seconds) {
            Some(bin) => {
                self.set.increment(variable, bin);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn bin_all(&mut self, variable: LatencyVariable, values: &[Option<f64>], stats: &mut PairingStats) -> Result<()> {
        for value in values {
            match value {
                Some(seconds) if self.bin(variable, *seconds)? => stats.binned += 1,
                _ => stats.dropped += 1,
            }
        }
        Ok(())
    }

    /// Bin every sample of one pairing plus its two per-pairing minimums
    pub fn record_pairing(&mut self, samples: &PairingSamples, locality: Locality) -> Result<PairingStats> {
        self.ensure_open()?;
        let mut stats = PairingStats::default();

        self.bin_all(LatencyVariable::Timer, &samples.timer_overhead, &mut stats)?;
        self.bin_all(LatencyVariable::onesided(locality), &samples.one_sided, &mut stats)?;
        self.bin_all(LatencyVariable::pairwise(locality), &samples.pairwise, &mut stats)?;

        stats.min_one_sided = positive_minimum(&samples.one_sided);
        stats.min_pairwise = positive_minimum(&samples.pairwise);

        if let Some(min) = stats.min_one_sided {
            self.bin(LatencyVariable::onesided_minimum(locality), min)?;
        }
        if let Some(min) = stats.min_pairwise {
            self.bin(LatencyVariable::pairwise_minimum(locality), min)?;
        }

        self.dropped += stats.dropped;
        Ok(stats)
    }

    /// Close the aggregator; further binning fails
    pub fn finalize(&mut self) -> &HistogramSet {
        self.state = AggregatorState::Finalized;
        &self.set
    }

    /// Read-only view of the histograms
    pub fn histograms(&self) -> &HistogramSet {
        &self.set
    }

    pub fn into_histograms(mut self) -> HistogramSet {
        self.state = AggregatorState::Finalized;
        self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(one_sided: &[f64], peer: &[f64]) -> PairingSamples {
        let one_sided: Vec<_> = one_sided.iter().map(|&v| valid_sample(v)).collect();
        let peer: Vec<_> = peer.iter().map(|&v| valid_sample(v)).collect();
        PairingSamples {
            timer_overhead: vec![Some(2e-8); one_sided.len()],
            pairwise: derive_pairwise(&one_sided, &peer),
            one_sided,
        }
    }

    #[test]
    fn test_default_layout() {
        let layout = BinLayout::default();
        assert_eq!(layout, BinLayout::with_bins_per_decade(DEFAULT_BINS_PER_DECADE).unwrap());
        assert_eq!(layout.num_bins(), 502);
    }

    #[test]
    fn test_layout_rejects_bad_ranges() {
        assert!(BinLayout::new(0.0, 1.0, 10).is_err());
        assert!(BinLayout::new(1.0, 1.0, 10).is_err());
        assert!(BinLayout::new(1e-9, 1.0, 0).is_err());
        assert!(BinLayout::new(f64::NAN, 1.0, 10).is_err());
    }

    #[test]
    fn test_time_to_bin_edges() {
        let layout = BinLayout::default();
        assert_eq!(layout.time_to_bin(0.0), Some(0));
        assert_eq!(layout.time_to_bin(5e-10), Some(0));
        assert_eq!(layout.time_to_bin(1e-9), Some(1));
        assert_eq!(layout.time_to_bin(10.0), Some(layout.num_bins() - 1));
        assert_eq!(layout.time_to_bin(1e6), Some(layout.num_bins() - 1));
        assert_eq!(layout.time_to_bin(-1e-6), None);
        assert_eq!(layout.time_to_bin(f64::NAN), None);
        assert_eq!(layout.time_to_bin(f64::INFINITY), Some(layout.num_bins() - 1));
    }

    #[test]
    fn test_time_to_bin_is_monotonic() {
        let layout = BinLayout::default();
        let mut previous = 0;
        let mut value = 1e-11;
        while value < 100.0 {
            let bin = layout.time_to_bin(value).unwrap();
            assert!(bin >= previous, "bin for {} went backwards", value);
            assert!(layout.bin_lower_bound(bin) <= value * (1.0 + 1e-9));
            previous = bin;
            value *= 1.07;
        }
    }

    #[test]
    fn test_bin_bounds() {
        let layout = BinLayout::new(1e-6, 1e-3, 1).unwrap();
        assert_eq!(layout.num_bins(), 5);
        assert_eq!(layout.bin_lower_bound(0), 0.0);
        assert!((layout.bin_lower_bound(2) - 1e-5).abs() < 1e-18);
        assert_eq!(layout.bin_upper_bound(3), 1e-3);
        assert_eq!(layout.bin_lower_bound(4), 1e-3);
        assert!(layout.bin_upper_bound(4).is_infinite());
    }

    #[test]
    fn test_labels_match_order() {
        let labels: Vec<_> = LatencyVariable::ALL.iter().map(|v| v.label()).collect();
        assert_eq!(
            labels,
            vec![
                "timer",
                "onNodeOnesided",
                "onNodePairwise",
                "onNodeOnesidedMinimum",
                "onNodePairwiseMinimum",
                "offNodeOnesided",
                "offNodePairwise",
                "offNodeOnesidedMinimum",
                "offNodePairwiseMinimum",
            ]
        );
        let json = serde_json::to_string(&LatencyVariable::OffNodePairwiseMinimum).unwrap();
        assert_eq!(json, "\"offNodePairwiseMinimum\"");
        let minimums = LatencyVariable::ALL.iter().filter(|v| v.is_minimum()).count();
        assert_eq!(minimums, 4);
        assert!(!LatencyVariable::Timer.is_minimum());
    }

    #[test]
    fn test_bin_rejects_negative() {
        let mut aggregator = Aggregator::new(BinLayout::default());
        assert!(!aggregator.bin(LatencyVariable::Timer, -1.0).unwrap());
        assert!(aggregator.bin(LatencyVariable::Timer, 1e-7).unwrap());
        assert_eq!(aggregator.histograms().total(LatencyVariable::Timer), 1);
    }

    #[test]
    fn test_pairwise_derivation() {
        let mine = vec![Some(1e-6), Some(3e-6), None, Some(2e-6)];
        let theirs = vec![Some(3e-6), Some(1e-6), Some(1e-6), None];
        let pairwise = derive_pairwise(&mine, &theirs);
        assert_eq!(pairwise, vec![Some(2e-6), Some(2e-6), None, None]);
        assert_eq!(derive_pairwise(&theirs, &mine), pairwise);
    }

    #[test]
    fn test_record_pairing_routes_by_locality() {
        let mut aggregator = Aggregator::new(BinLayout::default());
        let on = samples(&[1e-6, 2e-6, 3e-6], &[1e-6, 2e-6, 3e-6]);
        let off = samples(&[5e-6, 6e-6], &[5e-6, 6e-6]);

        aggregator.record_pairing(&on, Locality::OnNode).unwrap();
        aggregator.record_pairing(&off, Locality::OffNode).unwrap();

        let set = aggregator.finalize();
        assert_eq!(set.total(LatencyVariable::Timer), 5);
        assert_eq!(set.total(LatencyVariable::OnNodeOnesided), 3);
        assert_eq!(set.total(LatencyVariable::OnNodePairwise), 3);
        assert_eq!(set.total(LatencyVariable::OffNodeOnesided), 2);
        assert_eq!(set.total(LatencyVariable::OffNodePairwise), 2);
        assert_eq!(set.total(LatencyVariable::OnNodeOnesidedMinimum), 1);
        assert_eq!(set.total(LatencyVariable::OnNodePairwiseMinimum), 1);
        assert_eq!(set.total(LatencyVariable::OffNodeOnesidedMinimum), 1);
        assert_eq!(set.total(LatencyVariable::OffNodePairwiseMinimum), 1);
    }

    #[test]
    fn test_sentinel_samples_are_dropped() {
        let mut aggregator = Aggregator::new(BinLayout::default());
        let mut pairing = samples(&[1e-6, -1.0, 2e-6], &[1e-6, 1e-6, 2e-6]);
        pairing.timer_overhead = vec![Some(1e-8); 3];

        let stats = aggregator.record_pairing(&pairing, Locality::OffNode).unwrap();
        let set = aggregator.histograms();

        assert_eq!(set.total(LatencyVariable::OffNodeOnesided), 2);
        assert_eq!(set.total(LatencyVariable::OffNodePairwise), 2);
        assert_eq!(stats.dropped, 2);
        assert_eq!(aggregator.dropped_samples(), 2);
        assert_eq!(stats.min_one_sided, Some(1e-6));
    }

    #[test]
    fn test_minimum_needs_positive_value() {
        let mut aggregator = Aggregator::new(BinLayout::default());
        let pairing = samples(&[0.0, 0.0], &[0.0, 0.0]);
        aggregator.record_pairing(&pairing, Locality::OnNode).unwrap();

        let set = aggregator.histograms();
        assert_eq!(set.total(LatencyVariable::OnNodeOnesided), 2);
        assert_eq!(set.get(LatencyVariable::OnNodeOnesided).count(0), 2);
        assert_eq!(set.total(LatencyVariable::OnNodeOnesidedMinimum), 0);
        assert_eq!(set.total(LatencyVariable::OnNodePairwiseMinimum), 0);
    }

    #[test]
    fn test_finalized_aggregator_refuses_samples() {
        let mut aggregator = Aggregator::new(BinLayout::default());
        aggregator.finalize();
        assert_eq!(aggregator.state(), AggregatorState::Finalized);
        assert!(aggregator.bin(LatencyVariable::Timer, 1e-6).is_err());
        assert!(aggregator
            .record_pairing(&PairingSamples::default(), Locality::OnNode)
            .is_err());
    }

    #[test]
    fn test_merge_sums_counts() {
        let layout = BinLayout::default();
        let mut a = Aggregator::new(layout);
        let mut b = Aggregator::new(layout);
        a.bin(LatencyVariable::OffNodeOnesided, 1e-6).unwrap();
        b.bin(LatencyVariable::OffNodeOnesided, 1e-6).unwrap();
        b.bin(LatencyVariable::Timer, 1e-8).unwrap();

        let mut merged = a.into_histograms();
        merged.merge(&b.into_histograms()).unwrap();

        let bin = layout.time_to_bin(1e-6).unwrap();
        assert_eq!(merged.get(LatencyVariable::OffNodeOnesided).count(bin), 2);
        assert_eq!(merged.total(LatencyVariable::Timer), 1);
    }

    #[test]
    fn test_merge_rejects_other_layout() {
        let mut a = HistogramSet::new(BinLayout::default());
        let b = HistogramSet::new(BinLayout::with_bins_per_decade(10).unwrap());
        assert!(a.merge(&b).is_err());
    }

    fn decoded_set(tamper: impl FnOnce(&mut serde_json::Value)) -> HistogramSet {
        let mut value = serde_json::to_value(HistogramSet::new(BinLayout::default())).unwrap();
        tamper(&mut value);
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_decoded_sets() {
        assert!(decoded_set(|_| {}).validate().is_ok());

        let short = decoded_set(|value| {
            value["histograms"]["timer"]["counts"].as_array_mut().unwrap().pop();
        });
        match short.validate() {
            Err(AppError::Histogram(message)) => assert!(message.contains("'timer' has 501 bins"), "{}", message),
            other => panic!("expected a histogram error, got {:?}", other),
        }

        let missing = decoded_set(|value| {
            value["histograms"].as_object_mut().unwrap().remove("offNodePairwise");
        });
        assert!(matches!(missing.validate(), Err(AppError::Histogram(_))));
    }

    #[test]
    fn test_merge_rejects_short_histogram() {
        let mut total = HistogramSet::new(BinLayout::default());
        let short = decoded_set(|value| {
            value["histograms"]["onNodeOnesided"]["counts"].as_array_mut().unwrap().truncate(10);
        });
        assert!(matches!(total.merge(&short), Err(AppError::Histogram(_))));
        assert_eq!(total, HistogramSet::new(BinLayout::default()));
    }

    #[test]
    fn test_non_empty_bins() {
        let layout = BinLayout::default();
        let mut aggregator = Aggregator::new(layout);
        aggregator.bin(LatencyVariable::Timer, 3e-8).unwrap();
        aggregator.bin(LatencyVariable::Timer, 3e-8).unwrap();
        aggregator.bin(LatencyVariable::Timer, 2e-3).unwrap();

        let bins = aggregator.histograms().get(LatencyVariable::Timer).non_empty_bins(&layout);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].count, 2);
        assert!(bins[0].lower_seconds <= 3e-8 && 3e-8 < bins[0].upper_seconds);
        assert!(bins[1].index > bins[0].index);
    }
}
