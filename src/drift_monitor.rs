//! Distribution drift monitoring via the Population Stability Index
//!
//! Maintains reference/current sample windows per monitored feature
//! dimension plus one window for prediction scores. PSI is computed over
//! quantile-derived bins with Laplace smoothing; the maximum PSI across
//! checked dimensions drives the overall status.
//!
//! Known limitation, kept intentionally: when the reference window holds
//! fewer than 100 samples and the current window exceeds 1,000, the
//! current window is promoted wholesale to become the reference and then
//! cleared. Drift occurring during that bootstrap phase is invisible.

use crate::metrics;
use parking_lot::RwLock;
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Reference window capacity
pub const DEFAULT_REFERENCE_WINDOW: usize = 10_000;

/// Current window capacity
pub const DEFAULT_CURRENT_WINDOW: usize = 1_000;

/// Number of PSI bins
pub const DEFAULT_PSI_BINS: usize = 10;

/// Feature dimensions monitored (leading dimensions of the vector)
pub const DEFAULT_MONITORED_DIMS: usize = 10;

/// Both windows must exceed this count before a dimension is checked
const MIN_SAMPLES_FOR_PSI: usize = 100;

/// Rebaseline fires when reference < this ...
const REBASELINE_REFERENCE_MAX: usize = 100;

/// ... and current > this
const REBASELINE_CURRENT_MIN: usize = 1_000;

/// Drift severity derived from the maximum PSI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Normal,
    Warning,
    Critical,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::Normal => "normal",
            DriftStatus::Warning => "warning",
            DriftStatus::Critical => "critical",
        }
    }
}

/// Monitor tuning knobs
#[derive(Debug, Clone)]
pub struct DriftMonitorConfig {
    pub reference_window: usize,
    pub current_window: usize,
    pub psi_bins: usize,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub monitored_dims: usize,
}

impl Default for DriftMonitorConfig {
    fn default() -> Self {
        Self {
            reference_window: DEFAULT_REFERENCE_WINDOW,
            current_window: DEFAULT_CURRENT_WINDOW,
            psi_bins: DEFAULT_PSI_BINS,
            warning_threshold: 0.1,
            critical_threshold: 0.2,
            monitored_dims: DEFAULT_MONITORED_DIMS,
        }
    }
}

/// One reference/current window pair
struct DistributionWindow {
    reference: VecDeque<f64>,
    current: VecDeque<f64>,
    reference_cap: usize,
    current_cap: usize,
}

impl DistributionWindow {
    fn new(reference_cap: usize, current_cap: usize) -> Self {
        Self {
            reference: VecDeque::with_capacity(reference_cap.min(1024)),
            current: VecDeque::with_capacity(current_cap.min(1024)),
            reference_cap,
            current_cap,
        }
    }

    fn record(&mut self, sample: f64) {
        if !sample.is_finite() {
            return;
        }
        if self.current.len() >= self.current_cap {
            self.current.pop_front();
        }
        self.current.push_back(sample);
    }

    /// Bootstrap promotion: current becomes the reference, current clears.
    /// The nominal trigger is 1,000 current samples; a smaller configured
    /// window triggers when full, since it can never grow past its cap.
    fn maybe_rebaseline(&mut self) -> bool {
        let trigger = REBASELINE_CURRENT_MIN.min(self.current_cap);
        if self.reference.len() < REBASELINE_REFERENCE_MAX && self.current.len() >= trigger {
            self.promote_current();
            return true;
        }
        false
    }

    fn promote_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.reference = std::mem::take(&mut self.current);
        while self.reference.len() > self.reference_cap {
            self.reference.pop_front();
        }
    }

    fn checkable(&self) -> bool {
        self.reference.len() > MIN_SAMPLES_FOR_PSI && self.current.len() > MIN_SAMPLES_FOR_PSI
    }

    fn snapshot(&self) -> (Vec<f64>, Vec<f64>) {
        (
            self.reference.iter().copied().collect(),
            self.current.iter().copied().collect(),
        )
    }
}

/// Drift metrics for one checked dimension
#[derive(Debug, Clone, Serialize)]
pub struct DimensionDrift {
    pub dimension: usize,
    pub psi: f64,
    pub p_value: f64,
}

/// Structured result of a drift check
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub status: DriftStatus,
    pub max_psi: f64,
    pub feature_drift: Vec<DimensionDrift>,
    pub prediction_psi: Option<f64>,
    /// Dimensions whose PSI reached the warning threshold
    pub drifted_dimensions: Vec<usize>,
    pub rebaselined: bool,
    pub reference_samples: usize,
    pub current_samples: usize,
}

impl DriftReport {
    fn empty() -> Self {
        Self {
            status: DriftStatus::Normal,
            max_psi: 0.0,
            feature_drift: Vec::new(),
            prediction_psi: None,
            drifted_dimensions: Vec::new(),
            rebaselined: false,
            reference_samples: 0,
            current_samples: 0,
        }
    }
}

/// Tracks feature and prediction distributions for one model.
pub struct DriftMonitor {
    config: DriftMonitorConfig,
    feature_windows: RwLock<Vec<DistributionWindow>>,
    prediction_window: RwLock<DistributionWindow>,
    checks: AtomicU64,
    rebaselines: AtomicU64,
    last_report: RwLock<Option<DriftReport>>,
}

impl DriftMonitor {
    pub fn new(config: DriftMonitorConfig) -> Self {
        let windows = (0..config.monitored_dims)
            .map(|_| DistributionWindow::new(config.reference_window, config.current_window))
            .collect();
        let prediction =
            DistributionWindow::new(config.reference_window, config.current_window);
        Self {
            config,
            feature_windows: RwLock::new(windows),
            prediction_window: RwLock::new(prediction),
            checks: AtomicU64::new(0),
            rebaselines: AtomicU64::new(0),
            last_report: RwLock::new(None),
        }
    }

    /// Records the leading monitored dimensions of a feature vector.
    pub fn record_feature_sample(&self, values: &[f32]) {
        let mut windows = self.feature_windows.write();
        for (dim, window) in windows.iter_mut().enumerate() {
            if let Some(v) = values.get(dim) {
                window.record(*v as f64);
            }
        }
    }

    /// Records one model prediction score.
    pub fn record_prediction_sample(&self, score: f64) {
        self.prediction_window.write().record(score);
    }

    /// Seeds the reference windows directly (warm start from historical
    /// data). `dim_samples[d]` feeds dimension `d`.
    pub fn seed_feature_reference(&self, dim_samples: &[Vec<f64>]) {
        let mut windows = self.feature_windows.write();
        for (dim, samples) in dim_samples.iter().enumerate() {
            if let Some(window) = windows.get_mut(dim) {
                window.reference.clear();
                for s in samples.iter().filter(|s| s.is_finite()) {
                    if window.reference.len() >= window.reference_cap {
                        window.reference.pop_front();
                    }
                    window.reference.push_back(*s);
                }
            }
        }
    }

    pub fn seed_prediction_reference(&self, samples: &[f64]) {
        let mut window = self.prediction_window.write();
        window.reference.clear();
        for s in samples.iter().filter(|s| s.is_finite()) {
            if window.reference.len() >= window.reference_cap {
                window.reference.pop_front();
            }
            window.reference.push_back(*s);
        }
    }

    /// Promotes current windows into the reference after a successful
    /// retrain, so subsequent drift is measured against the fresh model's
    /// input distribution. Windows with no current samples are left alone.
    pub fn refresh_baseline(&self) {
        let mut windows = self.feature_windows.write();
        for window in windows.iter_mut() {
            window.promote_current();
        }
        drop(windows);
        self.prediction_window.write().promote_current();
        info!("drift baseline refreshed from current windows");
    }

    /// Runs the drift check across all monitored windows.
    pub fn check_drift(&self) -> DriftReport {
        self.checks.fetch_add(1, Ordering::Relaxed);
        metrics::DRIFT_CHECKS_TOTAL.inc();

        let mut rebaselined = false;
        let mut snapshots: Vec<(usize, Vec<f64>, Vec<f64>)> = Vec::new();
        let mut reference_samples = 0;
        let mut current_samples = 0;
        {
            let mut windows = self.feature_windows.write();
            for (dim, window) in windows.iter_mut().enumerate() {
                if window.maybe_rebaseline() {
                    rebaselined = true;
                }
                reference_samples = reference_samples.max(window.reference.len());
                current_samples = current_samples.max(window.current.len());
                if window.checkable() {
                    let (r, c) = window.snapshot();
                    snapshots.push((dim, r, c));
                }
            }
        }

        let prediction_snapshot = {
            let mut window = self.prediction_window.write();
            if window.maybe_rebaseline() {
                rebaselined = true;
            }
            if window.checkable() {
                Some(window.snapshot())
            } else {
                None
            }
        };

        if rebaselined {
            self.rebaselines.fetch_add(1, Ordering::Relaxed);
            metrics::DRIFT_REBASELINES_TOTAL.inc();
            info!("drift windows rebaselined; current promoted to reference");
        }

        let mut report = DriftReport::empty();
        report.rebaselined = rebaselined;
        report.reference_samples = reference_samples;
        report.current_samples = current_samples;

        for (dim, reference, current) in &snapshots {
            let psi = compute_psi(reference, current, self.config.psi_bins);
            let p_value = chi_square_p_value(reference, current, self.config.psi_bins);
            report.max_psi = report.max_psi.max(psi);
            if psi >= self.config.warning_threshold {
                report.drifted_dimensions.push(*dim);
            }
            report.feature_drift.push(DimensionDrift {
                dimension: *dim,
                psi,
                p_value,
            });
        }

        if let Some((reference, current)) = &prediction_snapshot {
            let psi = compute_psi(reference, current, self.config.psi_bins);
            report.max_psi = report.max_psi.max(psi);
            report.prediction_psi = Some(psi);
        }

        report.status = if report.max_psi >= self.config.critical_threshold {
            DriftStatus::Critical
        } else if report.max_psi >= self.config.warning_threshold {
            DriftStatus::Warning
        } else {
            DriftStatus::Normal
        };

        match report.status {
            DriftStatus::Normal => {}
            DriftStatus::Warning => {
                metrics::DRIFT_WARNINGS_TOTAL.inc();
                warn!(
                    max_psi = report.max_psi,
                    dims = ?report.drifted_dimensions,
                    "feature drift warning"
                );
            }
            DriftStatus::Critical => {
                metrics::DRIFT_CRITICAL_TOTAL.inc();
                warn!(
                    max_psi = report.max_psi,
                    dims = ?report.drifted_dimensions,
                    "feature drift critical"
                );
            }
        }
        metrics::DRIFT_MAX_PSI.set(report.max_psi);

        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Minimum chi-square p-value across checkable feature dimensions.
    /// `None` when no dimension has enough samples.
    pub fn min_feature_p_value(&self) -> Option<f64> {
        let windows = self.feature_windows.read();
        let mut min_p: Option<f64> = None;
        for window in windows.iter() {
            if !window.checkable() {
                continue;
            }
            let (reference, current) = window.snapshot();
            let p = chi_square_p_value(&reference, &current, self.config.psi_bins);
            min_p = Some(match min_p {
                Some(m) => m.min(p),
                None => p,
            });
        }
        min_p
    }

    pub fn last_report(&self) -> Option<DriftReport> {
        self.last_report.read().clone()
    }

    pub fn check_count(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn rebaseline_count(&self) -> u64 {
        self.rebaselines.load(Ordering::Relaxed)
    }
}

impl Default for DriftMonitor {
    fn default() -> Self {
        Self::new(DriftMonitorConfig::default())
    }
}

// ============================================================================
// Statistics helpers
// ============================================================================

/// Linear-interpolation percentile (q in [0, 100]) over unsorted samples
fn percentile(samples: &[f64], q: f64) -> f64 {
    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Histogram over `bins` equal-width buckets spanning [lo, hi]; samples
/// outside the span are dropped, the upper edge is inclusive.
fn histogram(samples: &[f64], lo: f64, hi: f64, bins: usize) -> Vec<u64> {
    let mut counts = vec![0u64; bins];
    let span = hi - lo;
    for &s in samples {
        if s < lo || s > hi {
            continue;
        }
        let mut idx = ((s - lo) / span * bins as f64).floor() as usize;
        if idx >= bins {
            idx = bins - 1;
        }
        counts[idx] += 1;
    }
    counts
}

/// Population Stability Index between two sample windows.
///
/// Bin edges come from the 1st/99th percentile of the pooled samples; bin
/// proportions are Laplace-smoothed as `(count + 1) / (n + bins)` with `n`
/// the full window size, matching the source definition.
pub fn compute_psi(reference: &[f64], current: &[f64], bins: usize) -> f64 {
    if reference.is_empty() || current.is_empty() || bins == 0 {
        return 0.0;
    }
    let mut pooled = Vec::with_capacity(reference.len() + current.len());
    pooled.extend_from_slice(reference);
    pooled.extend_from_slice(current);

    let lo = percentile(&pooled, 1.0);
    let hi = percentile(&pooled, 99.0);
    if (hi - lo).abs() < f64::EPSILON {
        return 0.0;
    }

    let ref_hist = histogram(reference, lo, hi, bins);
    let cur_hist = histogram(current, lo, hi, bins);

    let ref_n = reference.len() as f64;
    let cur_n = current.len() as f64;
    let bins_f = bins as f64;

    let mut psi = 0.0;
    for i in 0..bins {
        let ref_p = (ref_hist[i] as f64 + 1.0) / (ref_n + bins_f);
        let cur_p = (cur_hist[i] as f64 + 1.0) / (cur_n + bins_f);
        psi += (cur_p - ref_p) * (cur_p / ref_p).ln();
    }
    psi
}

/// Two-sample chi-square homogeneity test over the PSI bins. Returns the
/// p-value; 1.0 when the test is not applicable (identical ranges, empty
/// windows, or fewer than two populated bins).
pub fn chi_square_p_value(reference: &[f64], current: &[f64], bins: usize) -> f64 {
    if reference.is_empty() || current.is_empty() || bins == 0 {
        return 1.0;
    }
    let mut pooled = Vec::with_capacity(reference.len() + current.len());
    pooled.extend_from_slice(reference);
    pooled.extend_from_slice(current);

    let lo = percentile(&pooled, 1.0);
    let hi = percentile(&pooled, 99.0);
    if (hi - lo).abs() < f64::EPSILON {
        return 1.0;
    }

    let ref_hist = histogram(reference, lo, hi, bins);
    let cur_hist = histogram(current, lo, hi, bins);

    let r_total: u64 = ref_hist.iter().sum();
    let c_total: u64 = cur_hist.iter().sum();
    if r_total == 0 || c_total == 0 {
        return 1.0;
    }
    let n = (r_total + c_total) as f64;

    let mut statistic = 0.0;
    let mut populated_bins = 0usize;
    for i in 0..bins {
        let bin_total = ref_hist[i] + cur_hist[i];
        if bin_total == 0 {
            continue;
        }
        populated_bins += 1;
        let expected_ref = bin_total as f64 * r_total as f64 / n;
        let expected_cur = bin_total as f64 * c_total as f64 / n;
        statistic += (ref_hist[i] as f64 - expected_ref).powi(2) / expected_ref;
        statistic += (cur_hist[i] as f64 - expected_cur).powi(2) / expected_cur;
    }

    if populated_bins < 2 {
        return 1.0;
    }
    let df = (populated_bins - 1) as f64;
    match ChiSquared::new(df) {
        Ok(dist) => (1.0 - dist.cdf(statistic)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}
