//! Bounded latency sample window with percentile summaries

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of retained samples
pub const DEFAULT_LATENCY_WINDOW: usize = 1000;

/// Percentile summary over the current window
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Rolling latency tracker. Oldest samples evicted FIFO at capacity.
pub struct LatencyTracker {
    window: RwLock<VecDeque<f64>>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency_ms: f64) {
        if !latency_ms.is_finite() {
            return;
        }
        let mut window = self.window.write();
        if window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(latency_ms);
    }

    pub fn summary(&self) -> LatencySummary {
        let window = self.window.read();
        if window.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        LatencySummary {
            count: sorted.len(),
            mean_ms: mean,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }

    pub fn len(&self) -> usize {
        self.window.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.read().is_empty()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

/// Nearest-rank percentile over an ascending slice
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
