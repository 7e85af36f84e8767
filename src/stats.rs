//! Sample statistics for telemetry windows.

use serde::Serialize;

/// Summary of a numeric sample sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregatedStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

/// Linear-interpolation percentile over a sorted slice. For `p` in [0, 1],
/// index `i = p * (n - 1)` and the result interpolates between the two
/// neighbouring samples. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let index = p * (n - 1) as f64;
            let lo = index.floor() as usize;
            let hi = index.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                let weight = index - lo as f64;
                sorted[lo] * (1.0 - weight) + sorted[hi] * weight
            }
        }
    }
}

/// Compute min/max/avg/p95/p99 over a sample set. Empty input yields
/// all-zero stats.
pub fn aggregate(values: &[f64]) -> AggregatedStats {
    if values.is_empty() {
        return AggregatedStats::default();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    AggregatedStats {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        avg: values.iter().sum::<f64>() / values.len() as f64,
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
        count: values.len(),
    }
}
